//! Envoy `ext_authz` v3 message conversion.
//!
//! The gRPC endpoint decodes a `CheckRequest` into a [`FilterRequest`] and
//! encodes the chain's [`FilterResponse`] as a `CheckResponse`; a gRPC
//! External filter does the reverse towards its authorizer.

use std::collections::HashMap;

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::header_value_option::HeaderAppendAction;
use envoy_types::pb::envoy::config::core::v3::{HeaderValue as ProtoHeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::auth::v3::{
    AttributeContext, CheckRequest, CheckResponse, DeniedHttpResponse, OkHttpResponse,
    attribute_context, check_response,
};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use filter_api::{
    FilterRequest, FilterResponse, HeaderModification, HttpRequestModification, HttpResponse,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::resources::external::IncludeBody;

/// Set on the authorizer request when the forwarded body was cut short.
pub const PARTIAL_BODY_HEADER: &str = "x-envoy-auth-partial-body";

// ============================================================================
// Requests
// ============================================================================

/// Decode the HTTP attributes of a check into a filter request.
pub fn filter_request(check: &CheckRequest) -> Result<FilterRequest, String> {
    let http = check
        .attributes
        .as_ref()
        .and_then(|a| a.request.as_ref())
        .and_then(|r| r.http.as_ref())
        .ok_or_else(|| "CheckRequest has no attributes.request.http".to_string())?;

    let method = Method::from_bytes(http.method.as_bytes())
        .map_err(|e| format!("invalid method {:?}: {e}", http.method))?;

    let mut headers = HeaderMap::with_capacity(http.headers.len());
    for (name, value) in &http.headers {
        if name.starts_with(':') {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let mut path = http.path.clone();
    if !http.query.is_empty() && !path.contains('?') {
        path.push('?');
        path.push_str(&http.query);
    }

    let body = if http.raw_body.is_empty() {
        Bytes::from(http.body.clone())
    } else {
        Bytes::from(http.raw_body.clone())
    };

    Ok(FilterRequest {
        id: http.id.clone(),
        method,
        scheme: http.scheme.clone(),
        host: http.host.clone(),
        path,
        headers,
        body,
    })
}

/// Body to forward under `include`, and whether it was cut.
pub fn truncated_body(body: &Bytes, include: IncludeBody) -> (Bytes, bool) {
    if body.len() > include.max_bytes {
        (body.slice(..include.max_bytes), true)
    } else {
        (body.clone(), false)
    }
}

/// Encode a filter request as a check for an upstream authorizer.
pub fn check_request(request: &FilterRequest, include_body: Option<IncludeBody>) -> CheckRequest {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &request.headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push(',');
                v.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    let (body, raw_body) = match include_body {
        Some(include) => {
            let (body, truncated) = truncated_body(&request.body, include);
            if truncated && include.allow_partial {
                headers.insert(PARTIAL_BODY_HEADER.to_string(), "true".to_string());
            }
            (String::from_utf8_lossy(&body).into_owned(), body.to_vec())
        }
        None => (String::new(), Vec::new()),
    };

    let http = attribute_context::HttpRequest {
        id: request.id.clone(),
        method: request.method.to_string(),
        headers,
        path: request.path.clone(),
        host: request.host.clone(),
        scheme: request.scheme.clone(),
        query: request.query().unwrap_or_default().to_string(),
        size: i64::try_from(request.body.len()).unwrap_or(i64::MAX),
        protocol: "HTTP/1.1".to_string(),
        body,
        raw_body,
        ..Default::default()
    };

    CheckRequest {
        attributes: Some(AttributeContext {
            request: Some(attribute_context::Request {
                http: Some(http),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

// ============================================================================
// Responses
// ============================================================================

fn header_option(name: &HeaderName, value: &HeaderValue, action: HeaderAppendAction) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(ProtoHeaderValue {
            key: name.as_str().to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ..Default::default()
        }),
        append_action: action as i32,
        ..Default::default()
    }
}

/// Encode a chain result for the gateway.
pub fn check_response(response: &FilterResponse) -> CheckResponse {
    match response {
        FilterResponse::Modification(modification) => CheckResponse {
            status: Some(RpcStatus {
                code: tonic::Code::Ok as i32,
                ..Default::default()
            }),
            http_response: Some(check_response::HttpResponse::OkResponse(OkHttpResponse {
                headers: modification
                    .headers
                    .iter()
                    .map(|m| {
                        let action = if m.is_append() {
                            HeaderAppendAction::AppendIfExistsOrAdd
                        } else {
                            HeaderAppendAction::OverwriteIfExistsOrAdd
                        };
                        header_option(m.name(), m.value(), action)
                    })
                    .collect(),
                ..Default::default()
            })),
            ..Default::default()
        },
        FilterResponse::Response(denied) => CheckResponse {
            status: Some(RpcStatus {
                code: tonic::Code::Unauthenticated as i32,
                ..Default::default()
            }),
            http_response: Some(check_response::HttpResponse::DeniedResponse(
                DeniedHttpResponse {
                    status: Some(HttpStatus {
                        code: i32::from(denied.status.as_u16()),
                    }),
                    headers: denied
                        .headers
                        .iter()
                        .map(|(n, v)| header_option(n, v, HeaderAppendAction::AppendIfExistsOrAdd))
                        .collect(),
                    body: denied.body.clone(),
                },
            )),
            ..Default::default()
        },
    }
}

#[allow(deprecated)]
fn is_append(option: &HeaderValueOption) -> bool {
    match &option.append {
        Some(append) => append.value,
        None => option.append_action() == HeaderAppendAction::AppendIfExistsOrAdd,
    }
}

/// Decode an authorizer's answer.
pub fn filter_response(check: CheckResponse) -> FilterResponse {
    let code = check.status.as_ref().map_or(0, |s| s.code);
    if code == tonic::Code::Ok as i32 {
        let mut modification = HttpRequestModification::new();
        if let Some(check_response::HttpResponse::OkResponse(ok)) = check.http_response {
            for option in &ok.headers {
                let Some(header) = &option.header else { continue };
                let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(header.key.as_bytes()),
                    HeaderValue::from_str(&header.value),
                ) else {
                    continue;
                };
                modification.headers.push(if is_append(option) {
                    HeaderModification::Append { name, value }
                } else {
                    HeaderModification::Replace { name, value }
                });
            }
        }
        return modification.into();
    }

    let denied = match check.http_response {
        Some(check_response::HttpResponse::DeniedResponse(denied)) => denied,
        _ => DeniedHttpResponse::default(),
    };
    let status = denied
        .status
        .and_then(|s| u16::try_from(s.code).ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::FORBIDDEN);
    let mut response = HttpResponse::new(status);
    for option in &denied.headers {
        let Some(header) = &option.header else { continue };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.key.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            response.headers.append(name, value);
        }
    }
    response.body = denied.body;
    response.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::BoolValue;
    use pretty_assertions::assert_eq;

    fn check(headers: &[(&str, &str)], path: &str) -> CheckRequest {
        CheckRequest {
            attributes: Some(AttributeContext {
                request: Some(attribute_context::Request {
                    http: Some(attribute_context::HttpRequest {
                        id: "req-7".to_string(),
                        method: "POST".to_string(),
                        headers: headers
                            .iter()
                            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                            .collect(),
                        path: path.to_string(),
                        host: "gw.example:8443".to_string(),
                        scheme: "https".to_string(),
                        body: "hello".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn decodes_http_attributes() {
        let request = filter_request(&check(
            &[(":authority", "gw.example"), ("x-user", "bob")],
            "/api?x=1",
        ))
        .unwrap();
        assert_eq!(request.id, "req-7");
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url().unwrap().as_str(), "https://gw.example:8443/api?x=1");
        assert_eq!(request.header_str("x-user"), Some("bob"));
        assert!(request.headers.get(":authority").is_none());
        assert_eq!(&request.body[..], b"hello");
    }

    #[test]
    fn check_without_http_attributes_is_rejected() {
        assert!(filter_request(&CheckRequest::default()).is_err());
    }

    #[test]
    fn allow_encodes_append_and_overwrite() {
        let modification = HttpRequestModification::new()
            .replace(HeaderName::from_static("authorization"), HeaderValue::from_static("Bearer t"))
            .append(HeaderName::from_static("x-groups"), HeaderValue::from_static("ops"));
        let encoded = check_response(&modification.clone().into());

        assert_eq!(encoded.status.as_ref().unwrap().code, 0);
        let Some(check_response::HttpResponse::OkResponse(ok)) = &encoded.http_response else {
            panic!("expected ok response");
        };
        assert_eq!(ok.headers[0].append_action(), HeaderAppendAction::OverwriteIfExistsOrAdd);
        assert_eq!(ok.headers[1].append_action(), HeaderAppendAction::AppendIfExistsOrAdd);

        assert_eq!(filter_response(encoded), FilterResponse::Modification(modification));
    }

    #[test]
    fn deny_encodes_status_headers_and_body() {
        let denied = HttpResponse::json_error(StatusCode::UNAUTHORIZED, "unauthorized", "r");
        let encoded = check_response(&denied.clone().into());
        assert_eq!(encoded.status.as_ref().unwrap().code, tonic::Code::Unauthenticated as i32);
        assert_eq!(filter_response(encoded), FilterResponse::Response(denied));
    }

    #[test]
    fn legacy_append_flag_wins() {
        let mut option = header_option(
            &HeaderName::from_static("x-a"),
            &HeaderValue::from_static("1"),
            HeaderAppendAction::AppendIfExistsOrAdd,
        );
        #[allow(deprecated)]
        {
            option.append = Some(BoolValue { value: false });
        }
        let decoded = filter_response(CheckResponse {
            status: Some(RpcStatus::default()),
            http_response: Some(check_response::HttpResponse::OkResponse(OkHttpResponse {
                headers: vec![option],
                ..Default::default()
            })),
            ..Default::default()
        });
        let FilterResponse::Modification(m) = decoded else {
            panic!("expected allow");
        };
        assert!(!m.headers[0].is_append());
    }

    #[test]
    fn denied_without_status_defaults_to_forbidden() {
        let decoded = filter_response(CheckResponse {
            status: Some(RpcStatus {
                code: tonic::Code::PermissionDenied as i32,
                ..Default::default()
            }),
            ..Default::default()
        });
        let FilterResponse::Response(r) = decoded else {
            panic!("expected deny");
        };
        assert_eq!(r.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn body_is_truncated_and_flagged() {
        let mut request = FilterRequest::new(Method::POST, &url::Url::parse("http://a/b").unwrap());
        request.body = Bytes::from_static(b"0123456789");
        let encoded = check_request(
            &request,
            Some(IncludeBody {
                max_bytes: 4,
                allow_partial: true,
            }),
        );
        let http = encoded.attributes.unwrap().request.unwrap().http.unwrap();
        assert_eq!(http.body, "0123");
        assert_eq!(http.size, 10);
        assert_eq!(http.headers[PARTIAL_BODY_HEADER], "true");
    }
}
