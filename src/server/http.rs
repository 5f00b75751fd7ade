//! HTTP ext_authz endpoint.
//!
//! The gateway forwards the original request here (method, path, headers,
//! body). A 200 means allow, with the headers to set upstream as response
//! headers; anything else is the response for the client.

use std::time::{Duration, Instant};

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use filter_api::{FilterContext, FilterRequest, FilterResponse};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::evaluator::FilterMux;

/// Readiness check; 503 once shutdown has begun.
pub const READYZ_PATH: &str = "/_/sys/readyz";
/// Liveness check.
pub const HEALTHZ_PATH: &str = "/_/sys/healthz";

/// Handler state.
#[derive(Clone)]
pub struct HttpState {
    /// Evaluates every check
    pub mux: FilterMux,
    /// Deadline handed to filters, from arrival
    pub request_timeout: Duration,
    /// Soft shutdown token
    pub draining: CancellationToken,
}

/// Routes: the two health paths, and every other path as a check.
pub fn router(state: HttpState, max_body_size: usize) -> Router {
    Router::new()
        .route(READYZ_PATH, get(readyz))
        .route(HEALTHZ_PATH, get(healthz))
        .fallback(check)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn readyz(State(state): State<HttpState>) -> StatusCode {
    if state.draining.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `x-request-id`, or a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

/// Rebuild the checked request from what the gateway forwarded.
pub fn forwarded_request(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> FilterRequest {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| uri.authority().map(ToString::to_string))
        .unwrap_or_default();
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("http")
        .to_string();
    let path = uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);

    FilterRequest {
        id: request_id(&headers),
        method,
        scheme,
        host,
        path,
        headers,
        body,
    }
}

async fn check(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = forwarded_request(method, &uri, headers, body);
    let ctx = FilterContext {
        request_id: request.id.clone(),
        deadline: Some(Instant::now() + state.request_timeout),
    };

    match state.mux.evaluate(&ctx, request).await {
        FilterResponse::Modification(modification) => {
            let mut headers = HeaderMap::new();
            for edit in &modification.headers {
                edit.apply(&mut headers);
            }
            (StatusCode::OK, headers).into_response()
        }
        FilterResponse::Response(denied) => (denied.status, denied.headers, denied.body).into_response(),
    }
}
