//! Filter contract for the authz sidecar.
//!
//! A filter inspects a [`FilterRequest`] and answers with a [`FilterResponse`]:
//! either an [`HttpResponse`] that the gateway serves back to the client
//! (deny or redirect), or an [`HttpRequestModification`] that the gateway
//! applies to the request before forwarding it upstream (allow).
//!
//! Plugins implement [`Filter`] against these types only, so they can live
//! outside the sidecar crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use url::Url;

/// Boxed error returned by filters; the evaluator maps it to HTTP 500.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The request being authorized, as seen by a filter.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    /// Gateway-assigned request id (`x-request-id`)
    pub id: String,
    /// HTTP method
    pub method: Method,
    /// `http` or `https`
    pub scheme: String,
    /// Authority, possibly with port
    pub host: String,
    /// Request target: path plus optional `?query`
    pub path: String,
    /// Request headers, including modifications from earlier filters
    pub headers: HeaderMap,
    /// Request body, if the gateway forwarded one
    pub body: Bytes,
}

impl FilterRequest {
    /// Build a request from a method and an absolute URL.
    #[must_use]
    pub fn new(method: Method, url: &Url) -> Self {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        Self {
            id: String::new(),
            method,
            scheme: url.scheme().to_string(),
            host,
            path,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Reassemble the original request URL.
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.scheme.is_empty() {
            "http"
        } else {
            self.scheme.as_str()
        };
        if self.method == Method::CONNECT {
            return Url::parse(&format!("{scheme}://{}/", self.path));
        }
        Url::parse(&format!("{scheme}://{}{}", self.host, self.path))
    }

    /// Path without the query string.
    #[must_use]
    pub fn uri_path(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// Raw query string, without the leading `?`.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, q)| q)
    }

    /// First value of a form-decoded query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A single header edit produced by an allowing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderModification {
    /// Overwrite any existing value
    Replace {
        /// Header name
        name: HeaderName,
        /// New value
        value: HeaderValue,
    },
    /// Add to the existing value, comma-joined
    Append {
        /// Header name
        name: HeaderName,
        /// Value to append
        value: HeaderValue,
    },
}

impl HeaderModification {
    /// Header name this edit touches.
    #[must_use]
    pub fn name(&self) -> &HeaderName {
        match self {
            Self::Replace { name, .. } | Self::Append { name, .. } => name,
        }
    }

    /// Value carried by this edit.
    #[must_use]
    pub fn value(&self) -> &HeaderValue {
        match self {
            Self::Replace { value, .. } | Self::Append { value, .. } => value,
        }
    }

    /// Whether this edit appends rather than replaces.
    #[must_use]
    pub fn is_append(&self) -> bool {
        matches!(self, Self::Append { .. })
    }

    /// Apply the edit to a header map.
    pub fn apply(&self, headers: &mut HeaderMap) {
        match self {
            Self::Replace { name, value } => {
                headers.insert(name.clone(), value.clone());
            }
            Self::Append { name, value } => {
                let mut joined: Vec<u8> = Vec::new();
                for existing in headers.get_all(name) {
                    joined.extend_from_slice(existing.as_bytes());
                    joined.push(b',');
                }
                if joined.is_empty() {
                    headers.insert(name.clone(), value.clone());
                    return;
                }
                joined.extend_from_slice(value.as_bytes());
                match HeaderValue::from_bytes(&joined) {
                    Ok(combined) => {
                        headers.insert(name.clone(), combined);
                    }
                    Err(_) => {
                        headers.append(name.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// Ordered list of header edits; the ALLOW outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestModification {
    /// Edits, in the order they must be applied
    pub headers: Vec<HeaderModification>,
}

impl HttpRequestModification {
    /// Empty modification (allow, no changes).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style replace.
    #[must_use]
    pub fn replace(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push(HeaderModification::Replace { name, value });
        self
    }

    /// Builder-style append.
    #[must_use]
    pub fn append(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push(HeaderModification::Append { name, value });
        self
    }

    /// Apply every edit, in order, to the request.
    pub fn apply(&self, request: &mut FilterRequest) {
        for modification in &self.headers {
            modification.apply(&mut request.headers);
        }
    }

    /// Concatenate another modification onto this one.
    pub fn extend(&mut self, other: HttpRequestModification) {
        self.headers.extend(other.headers);
    }

    /// True when there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// A response the gateway serves to the client instead of forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// UTF-8 body
    pub body: String,
}

impl HttpResponse {
    /// Empty response with the given status.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    /// Redirect to `location`.
    pub fn redirect(status: StatusCode, location: &Url) -> Result<Self, header::InvalidHeaderValue> {
        let mut response = Self::new(status);
        response
            .headers
            .insert(header::LOCATION, HeaderValue::from_str(location.as_str())?);
        Ok(response)
    }

    /// JSON error body: `{"status_code", "message"}`, plus `request_id` for 5xx.
    #[must_use]
    pub fn json_error(status: StatusCode, message: &str, request_id: &str) -> Self {
        let mut body = serde_json::json!({
            "status_code": status.as_u16(),
            "message": message,
        });
        if status.is_server_error() {
            body["request_id"] = serde_json::Value::String(request_id.to_string());
        }
        let mut response = Self::new(status);
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response.body = body.to_string();
        response
    }
}

/// Outcome of a filter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResponse {
    /// Deny or redirect: serve this response to the client
    Response(HttpResponse),
    /// Allow: apply these header edits and forward
    Modification(HttpRequestModification),
}

impl FilterResponse {
    /// Allow without changes.
    #[must_use]
    pub fn allow() -> Self {
        Self::Modification(HttpRequestModification::new())
    }

    /// True for the allow variant.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Modification(_))
    }
}

impl From<HttpResponse> for FilterResponse {
    fn from(response: HttpResponse) -> Self {
        Self::Response(response)
    }
}

impl From<HttpRequestModification> for FilterResponse {
    fn from(modification: HttpRequestModification) -> Self {
        Self::Modification(modification)
    }
}

/// Per-request context handed to every filter.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// Request id, for log and error correlation
    pub request_id: String,
    /// When the gateway stops waiting for a decision
    pub deadline: Option<Instant>,
}

impl FilterContext {
    /// Time left before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The shorter of `limit` and the time left before the deadline.
    #[must_use]
    pub fn bounded(&self, limit: Duration) -> Duration {
        self.remaining().map_or(limit, |left| left.min(limit))
    }
}

/// A named authorization decision unit.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Decide on `request`.
    async fn filter(
        &self,
        ctx: &FilterContext,
        request: &FilterRequest,
    ) -> Result<FilterResponse, BoxError>;
}
