//! OAuth2 authorization-code client.
//!
//! A request carrying a valid access token (cookie or bearer header) is
//! allowed with the token forwarded upstream. Anything else is sent to the
//! IdP's authorization endpoint with a signed `state`; the IdP sends the
//! user agent back to `/callback`, where the code is exchanged and the
//! token set as a cookie.

pub mod discovery;
pub mod logout;
pub mod state;
pub mod token;

use async_trait::async_trait;
use cookie::Cookie;
use filter_api::{
    BoxError, Filter, FilterContext, FilterRequest, FilterResponse, HttpRequestModification,
    HttpResponse,
};
use http::{HeaderValue, StatusCode, header};
use tracing::{debug, warn};
use url::Url;

use self::discovery::{Discovery, discover};
use self::state::{check_state, sign_state};
use self::token::{exchange_code, validate_access_token};
use super::FilterDeps;
use crate::httpclient::HttpClient;
use crate::resources::oauth2::OAuth2Arguments;
use crate::resources::{OAuth2Spec, QName};
use crate::snapshot::CALLBACK_PATH;

/// Cookie holding the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// One invocation of an OAuth2 filter.
pub struct OAuth2Filter<'a> {
    qname: &'a QName,
    spec: &'a OAuth2Spec,
    arguments: OAuth2Arguments,
    deps: &'a FilterDeps,
}

impl<'a> OAuth2Filter<'a> {
    /// Bind a validated spec to a rule's arguments.
    pub fn new(
        qname: &'a QName,
        spec: &'a OAuth2Spec,
        arguments: OAuth2Arguments,
        deps: &'a FilterDeps,
    ) -> Self {
        Self {
            qname,
            spec,
            arguments,
            deps,
        }
    }

    fn client(&self) -> HttpClient {
        self.deps
            .http
            .client(self.spec.max_stale, self.spec.insecure_tls)
    }

    async fn callback(
        &self,
        ctx: &FilterContext,
        request: &FilterRequest,
        client: &HttpClient,
        discovery: &Discovery,
    ) -> Result<HttpResponse, BoxError> {
        if let Some(error) = request.query_param("error") {
            warn!(filter = %self.qname, error = %error, "Authorization server returned an error");
            return Ok(unauthorized(ctx));
        }
        let Some(code) = request.query_param("code") else {
            debug!(filter = %self.qname, "Callback without code");
            return Ok(unauthorized(ctx));
        };

        let state = request.query_param("state").unwrap_or_default();
        let redirect_url = match check_state(&state, &self.deps.keypair) {
            Ok(url) => url,
            Err(e) if e.is_malformed() => {
                debug!(filter = %self.qname, error = %e, "Callback state");
                return Ok(HttpResponse::json_error(
                    StatusCode::BAD_REQUEST,
                    "bad request",
                    &ctx.request_id,
                ));
            }
            Err(e) => {
                warn!(filter = %self.qname, error = %e, "Callback state");
                return Ok(unauthorized(ctx));
            }
        };

        let token = match exchange_code(client, &discovery.token_endpoint, self.spec, &code).await {
            Ok(token) => token,
            Err(e) => {
                warn!(filter = %self.qname, error = %e, "Authorization code exchange failed");
                return Ok(unauthorized(ctx));
            }
        };

        let mut cookie = Cookie::build((ACCESS_TOKEN_COOKIE, token.access_token))
            .path("/")
            .http_only(true)
            .secure(self.spec.tls);
        if let Some(expires_at) = token.expires_in.and_then(|expires_in| {
            let seconds = i64::try_from(expires_in).ok()?;
            time::OffsetDateTime::now_utc().checked_add(time::Duration::seconds(seconds))
        }) {
            cookie = cookie.expires(expires_at);
        }

        // 307 so that a POST that started the flow is replayed as a POST.
        let mut response = HttpResponse::redirect(StatusCode::TEMPORARY_REDIRECT, &redirect_url)?;
        response.headers.insert(
            header::SET_COOKIE,
            HeaderValue::from_str(&cookie.build().to_string())?,
        );
        debug!(filter = %self.qname, redirect_url = %redirect_url, "Callback complete");
        Ok(response)
    }

    fn authorization_redirect(
        &self,
        request: &FilterRequest,
        discovery: &Discovery,
    ) -> Result<HttpResponse, BoxError> {
        let original = request.url()?;
        let state = sign_state(&self.deps.keypair, &original, self.spec.state_ttl)?;
        let location = authorization_url(
            &discovery.authorization_endpoint,
            self.spec,
            &self.arguments.scopes,
            &state,
        );
        debug!(filter = %self.qname, location = %location, "Redirecting to authorization endpoint");
        Ok(HttpResponse::redirect(StatusCode::SEE_OTHER, &location)?)
    }
}

#[async_trait]
impl Filter for OAuth2Filter<'_> {
    async fn filter(
        &self,
        ctx: &FilterContext,
        request: &FilterRequest,
    ) -> Result<FilterResponse, BoxError> {
        let client = self.client();
        let (discovery, keys) = match discover(&client, self.spec).await {
            Ok(found) => found,
            Err(e) => {
                warn!(filter = %self.qname, error = %e, "OAuth2 discovery failed");
                return Ok(unauthorized(ctx).into());
            }
        };

        if let Some(token) = request_token(request) {
            match validate_access_token(
                &client,
                self.spec,
                &discovery,
                &keys,
                &self.arguments.scopes,
                &token,
            )
            .await
            {
                Ok(()) => {
                    let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
                    return Ok(HttpRequestModification::new()
                        .replace(header::AUTHORIZATION, value)
                        .into());
                }
                Err(e) => debug!(filter = %self.qname, error = %e, "Access token rejected"),
            }
        }

        if request.uri_path() == CALLBACK_PATH {
            return Ok(self.callback(ctx, request, &client, &discovery).await?.into());
        }

        if let Some(instead) = &self.arguments.instead_of_redirect
            && instead.if_request_header.matches(&request.headers)
        {
            let message = instead
                .status
                .canonical_reason()
                .unwrap_or("unauthorized")
                .to_ascii_lowercase();
            return Ok(HttpResponse::json_error(instead.status, &message, &ctx.request_id).into());
        }

        Ok(self.authorization_redirect(request, &discovery)?.into())
    }
}

fn unauthorized(ctx: &FilterContext) -> HttpResponse {
    HttpResponse::json_error(StatusCode::UNAUTHORIZED, "unauthorized", &ctx.request_id)
}

/// The access token: the cookie if set, else an RFC 6750 bearer header.
pub fn request_token(request: &FilterRequest) -> Option<String> {
    for value in request.headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for cookie in Cookie::split_parse(value).flatten() {
            if cookie.name() == ACCESS_TOKEN_COOKIE {
                return Some(cookie.value().to_string());
            }
        }
    }

    let authorization = request.header_str("authorization")?;
    let parts: Vec<&str> = authorization.split(' ').collect();
    match parts.as_slice() {
        [scheme, token] if scheme.eq_ignore_ascii_case("bearer") => Some((*token).to_string()),
        _ => None,
    }
}

/// `authorization_endpoint` with the code-flow parameters appended.
pub fn authorization_url(endpoint: &Url, spec: &OAuth2Spec, scopes: &[String], state: &str) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("audience", &spec.audience)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", spec.callback_url.as_str())
            .append_pair("client_id", &spec.client_id)
            .append_pair("state", state)
            .append_pair("scope", &scopes.join(" "));
        for (key, value) in &spec.extra_authorization_parameters {
            query.append_pair(key, value);
        }
    }
    url
}
