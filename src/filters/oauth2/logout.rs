//! `GET /.ambassador/oauth2/logout?realm=<name.namespace>`
//!
//! Expires the access token cookie set by an OAuth2 filter and sends the
//! user agent to the IdP's end-session endpoint, or back to the client URL
//! when the IdP has none.

use cookie::Cookie;
use filter_api::{FilterRequest, HttpResponse};
use http::{HeaderValue, StatusCode, header};
use tracing::{info, warn};

use super::ACCESS_TOKEN_COOKIE;
use super::discovery::discover_config;
use crate::filters::FilterDeps;
use crate::resources::QName;
use crate::snapshot::{FilterSpec, Snapshot};

/// Answer a logout request against the current snapshot.
pub async fn logout(snapshot: &Snapshot, deps: &FilterDeps, request: &FilterRequest) -> HttpResponse {
    let bad_request =
        |message: &str| HttpResponse::json_error(StatusCode::BAD_REQUEST, message, &request.id);

    let Some(realm) = request.query_param("realm") else {
        return bad_request("missing realm");
    };
    let Ok(qname) = realm.parse::<QName>() else {
        return bad_request("invalid realm");
    };
    let Some(info) = snapshot.filters.get(&qname) else {
        return bad_request("unknown realm");
    };
    let spec = match &info.spec {
        Ok(FilterSpec::OAuth2(spec)) => spec,
        Ok(_) => return bad_request("realm is not an OAuth2 filter"),
        Err(e) => {
            return HttpResponse::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("error in filter {qname} configuration: {e}"),
                &request.id,
            );
        }
    };

    let client = deps.http.client(spec.max_stale, spec.insecure_tls);
    let discovery = match discover_config(&client, spec).await {
        Ok(discovery) => discovery,
        Err(e) => {
            warn!(filter = %qname, error = %e, "OAuth2 discovery failed during logout");
            return HttpResponse::json_error(StatusCode::UNAUTHORIZED, "unauthorized", &request.id);
        }
    };

    let location = match discovery.end_session_endpoint {
        Some(mut endpoint) => {
            endpoint
                .query_pairs_mut()
                .append_pair("post_logout_redirect_uri", spec.client_url.as_str());
            endpoint
        }
        None => spec.client_url.clone(),
    };

    let expired = Cookie::build((ACCESS_TOKEN_COOKIE, ""))
        .path("/")
        .http_only(true)
        .secure(spec.tls)
        .max_age(time::Duration::ZERO)
        .build();

    let mut response = match HttpResponse::redirect(StatusCode::SEE_OTHER, &location) {
        Ok(response) => response,
        Err(e) => {
            return HttpResponse::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &e.to_string(),
                &request.id,
            );
        }
    };
    if let Ok(value) = HeaderValue::from_str(&expired.to_string()) {
        response.headers.insert(header::SET_COOKIE, value);
    }
    info!(filter = %qname, location = %location, "Logout");
    response
}
