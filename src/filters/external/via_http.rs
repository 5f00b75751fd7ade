//! Authorizer reached over plain HTTP.
//!
//! The authorizer sees the original method and path (under `pathPrefix`)
//! and only the allowed request headers. A 200 allows, copying the allowed
//! authorization headers onto the request; anything else is relayed to the
//! client as the deny.

use std::time::Duration;

use filter_api::{FilterRequest, FilterResponse, HttpRequestModification, HttpResponse};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};

use crate::extauthz::{PARTIAL_BODY_HEADER, truncated_body};
use crate::resources::ExternalSpec;

const LINKERD_DST_OVERRIDE: &str = "l5d-dst-override";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name == "keep-alive" || name == "proxy-connection"
}

/// The URL the authorizer is asked at.
pub(super) fn authorizer_url(spec: &ExternalSpec, request: &FilterRequest) -> String {
    let scheme = if spec.tls { "https" } else { "http" };
    format!(
        "{scheme}://{}{}{}",
        spec.auth_service, spec.path_prefix, request.path
    )
}

pub(super) async fn check(
    client: &reqwest::Client,
    spec: &ExternalSpec,
    request: &FilterRequest,
    timeout: Duration,
) -> Result<FilterResponse, reqwest::Error> {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if spec
            .allowed_request_headers
            .iter()
            .any(|allowed| allowed == name.as_str())
        {
            headers.append(name.clone(), value.clone());
        }
    }
    if spec.add_linkerd_headers
        && let Ok(value) = HeaderValue::from_str(&spec.auth_service)
    {
        headers.insert(LINKERD_DST_OVERRIDE, value);
    }

    let mut builder = client
        .request(request.method.clone(), authorizer_url(spec, request))
        .timeout(timeout);
    if let Some(include) = spec.include_body {
        let (body, truncated) = truncated_body(&request.body, include);
        if truncated && include.allow_partial {
            headers.insert(PARTIAL_BODY_HEADER, HeaderValue::from_static("true"));
        }
        builder = builder.body(body);
    }

    let response = builder.headers(headers).send().await?;
    let status = response.status();
    let response_headers = response.headers().clone();

    if status == StatusCode::OK {
        let mut modification = HttpRequestModification::new();
        for allowed in &spec.allowed_authorization_headers {
            if let Some(value) = response_headers.get(allowed.as_str())
                && let Ok(name) = HeaderName::from_bytes(allowed.as_bytes())
            {
                modification = modification.replace(name, value.clone());
            }
        }
        return Ok(modification.into());
    }

    let body = response.text().await?;
    let mut denied = HttpResponse::new(status);
    for (name, value) in &response_headers {
        if !is_hop_by_hop(name) {
            denied.headers.append(name.clone(), value.clone());
        }
    }
    denied.body = body;
    Ok(denied.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ExternalSpecRaw;
    use http::Method;
    use pretty_assertions::assert_eq;
    use url::Url;
    use wiremock::matchers::{body_string, header as has_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(yaml: &str) -> ExternalSpec {
        serde_yaml::from_str::<ExternalSpecRaw>(yaml)
            .unwrap()
            .validate()
            .unwrap()
    }

    fn request() -> FilterRequest {
        let mut r = FilterRequest::new(
            Method::POST,
            &Url::parse("https://gw.example/orders?id=4").unwrap(),
        );
        r.headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        r.headers.insert("x-secret", HeaderValue::from_static("nope"));
        r.headers.insert("x-tenant", HeaderValue::from_static("acme"));
        r.body = bytes::Bytes::from_static(b"0123456789");
        r
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[test]
    fn url_joins_prefix_and_path() {
        let spec = spec("{authService: 'https://authz:8443', pathPrefix: /extauth}");
        assert_eq!(
            authorizer_url(&spec, &request()),
            "https://authz:8443/extauth/orders?id=4"
        );
    }

    #[tokio::test]
    async fn ok_copies_allowed_authorization_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authz/orders"))
            .and(has_header("x-tenant", "acme"))
            .and(has_header(PARTIAL_BODY_HEADER, "true"))
            .and(body_string("0123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-user", "alice")
                    .insert_header("x-internal", "drop-me"),
            )
            .mount(&server)
            .await;

        let spec = spec(&format!(
            "{{authService: '{}', pathPrefix: /authz, allowedRequestHeaders: [X-Tenant], \
             allowedAuthorizationHeaders: [x-user], includeBody: {{maxBytes: 4, allowPartial: true}}}}",
            server.uri()
        ));
        let response = check(&client(), &spec, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        let FilterResponse::Modification(m) = response else {
            panic!("expected allow");
        };
        assert_eq!(m.headers.len(), 1);
        assert_eq!(m.headers[0].name(), "x-user");
        assert_eq!(m.headers[0].value(), "alice");
    }

    #[tokio::test]
    async fn other_status_is_relayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "https://login.example/")
                    .set_body_string("go log in"),
            )
            .mount(&server)
            .await;

        let spec = spec(&format!("authService: '{}'", server.uri()));
        let response = check(&client(), &spec, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        let FilterResponse::Response(r) = response else {
            panic!("expected deny");
        };
        assert_eq!(r.status, StatusCode::FOUND);
        assert_eq!(r.headers[header::LOCATION], "https://login.example/");
        assert!(r.headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(r.body, "go log in");
    }

    #[tokio::test]
    async fn disallowed_headers_are_not_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(has_header("x-secret", "nope"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let spec = spec(&format!("authService: '{}'", server.uri()));
        let response = check(&client(), &spec, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.is_allow());
    }
}
