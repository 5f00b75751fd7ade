//! Outbound HTTP with a shared response cache.
//!
//! Every filter that talks to an IdP (discovery, JWKS, userinfo, token
//! exchange) goes through an [`HttpClient`] handed out by the process-wide
//! [`HttpClientFactory`]. GETs consult the shared [`HttpCache`] first; each
//! request is logged with `origin = "NET"` or `origin = "CACHE"`.

mod cache;

pub use cache::{CacheStats, CachedResponse, Freshness, HttpCache, Lookup, cache_key, freshness};

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode, header};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use crate::Result;

/// Failures of a fetch that expects a successful response.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure or timeout
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    /// Origin answered with a non-success status
    #[error("{url}: unexpected status {status}")]
    Status {
        /// Requested URL
        url: String,
        /// Returned status
        status: StatusCode,
    },

    /// Body was not the expected JSON document
    #[error("{url}: invalid JSON: {source}")]
    Json {
        /// Requested URL
        url: String,
        /// Parser error
        source: serde_json::Error,
    },
}

/// Builds [`HttpClient`]s that share one cache and one connection pool per
/// TLS mode.
pub struct HttpClientFactory {
    cache: Arc<HttpCache>,
    verified: reqwest::Client,
    insecure: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl HttpClientFactory {
    /// Create the factory; `timeout` applies to every request it issues.
    pub fn new(cache: Arc<HttpCache>, timeout: Duration) -> Result<Self> {
        let builder = || reqwest::Client::builder().timeout(timeout);
        Ok(Self {
            cache,
            verified: builder().build()?,
            insecure: builder().danger_accept_invalid_certs(true).build()?,
            no_redirect: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
        })
    }

    /// The shared response cache.
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    /// Cached client with the given staleness allowance and TLS mode.
    pub fn client(&self, max_stale: Duration, insecure_tls: bool) -> HttpClient {
        let inner = if insecure_tls {
            self.insecure.clone()
        } else {
            self.verified.clone()
        };
        HttpClient {
            inner,
            cache: Arc::clone(&self.cache),
            max_stale,
        }
    }

    /// Uncached client that never follows redirects; callers set their own
    /// per-request timeout.
    pub fn no_redirect(&self) -> &reqwest::Client {
        &self.no_redirect
    }
}

/// Cache-aware HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    cache: Arc<HttpCache>,
    max_stale: Duration,
}

impl HttpClient {
    /// GET through the cache.
    pub async fn get(&self, url: &Url) -> std::result::Result<CachedResponse, reqwest::Error> {
        let key = cache_key(&Method::GET, url);

        let mut request = self.inner.get(url.clone());
        let stale = match self.cache.lookup(&key, self.max_stale) {
            Lookup::Hit(response) => {
                debug!(origin = "CACHE", method = "GET", url = %url, status = response.status.as_u16(), "HTTP client");
                return Ok(response);
            }
            Lookup::Stale {
                response,
                etag,
                last_modified,
            } => {
                if let Some(etag) = etag {
                    request = request.header(header::IF_NONE_MATCH, etag);
                }
                if let Some(last_modified) = last_modified {
                    request = request.header(header::IF_MODIFIED_SINCE, last_modified);
                }
                Some(response)
            }
            Lookup::Miss => None,
        };

        let upstream = request.send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(stored) = stale {
                if let Some(f) = freshness(stored.status, &merge_headers(&stored, &headers)) {
                    self.cache.refresh(&key, f);
                }
                debug!(origin = "CACHE", method = "GET", url = %url, status = stored.status.as_u16(), revalidated = true, "HTTP client");
                return Ok(stored);
            }
        }

        let body = upstream.bytes().await?;
        let response = CachedResponse {
            status,
            headers,
            body,
        };
        if let Some(f) = freshness(status, &response.headers) {
            self.cache.store(&key, response.clone(), f);
        }
        info!(origin = "NET", method = "GET", url = %url, status = status.as_u16(), "HTTP client");
        Ok(response)
    }

    /// GET through the cache and decode a successful JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> std::result::Result<T, FetchError> {
        let response = self.get(url).await?;
        if !response.status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Json {
            url: url.to_string(),
            source,
        })
    }

    /// Uncached GET carrying a bearer token (userinfo).
    pub async fn get_with_bearer(
        &self,
        url: &Url,
        token: &str,
    ) -> std::result::Result<CachedResponse, reqwest::Error> {
        let upstream = self.inner.get(url.clone()).bearer_auth(token).send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;
        info!(origin = "NET", method = "GET", url = %url, status = status.as_u16(), "HTTP client");
        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }

    /// Uncached `application/x-www-form-urlencoded` POST.
    pub async fn post_form(
        &self,
        url: &Url,
        form: &[(&str, &str)],
    ) -> std::result::Result<CachedResponse, reqwest::Error> {
        let upstream = self.inner.post(url.clone()).form(form).send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;
        info!(origin = "NET", method = "POST", url = %url, status = status.as_u16(), "HTTP client");
        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Stored headers updated with those of a `304` (RFC 7234 §4.3.4).
fn merge_headers(stored: &CachedResponse, fresh: &http::HeaderMap) -> http::HeaderMap {
    let mut merged = stored.headers.clone();
    for name in fresh.keys() {
        merged.remove(name);
        for value in fresh.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}
