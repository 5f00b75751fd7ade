//! External (delegated) filter settings.

use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Whole-call timeout unless the resource sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request headers always forwarded to the authorizer.
pub const ALWAYS_ALLOWED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "from",
    "proxy-authorization",
    "user-agent",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
];

/// Authorizer response headers always copied onto the request.
pub const ALWAYS_ALLOWED_AUTHORIZATION_HEADERS: &[&str] = &[
    "location",
    "authorization",
    "proxy-authenticate",
    "set-cookie",
    "www-authenticate",
];

/// Wire protocol to the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Plain HTTP request mirroring the original
    Http,
    /// Envoy ext_authz v3 `Check`
    Grpc,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
        })
    }
}

/// `includeBody` as written.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeBody {
    /// Bytes of body to forward
    #[serde(default, alias = "max_bytes")]
    pub max_bytes: usize,
    /// Forward a truncated body instead of failing
    #[serde(default, alias = "allow_partial")]
    pub allow_partial: bool,
}

/// `statusOnError` as written.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusOnError {
    /// Status returned when the authorizer cannot be reached
    #[serde(default)]
    pub code: u16,
}

/// External settings as written. Both camelCase and the older snake_case
/// spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpecRaw {
    /// `host[:port]`, optionally `http(s)://`-prefixed
    #[serde(default, alias = "auth_service")]
    pub auth_service: String,
    /// Prepended to the request path (http only)
    #[serde(default, alias = "path_prefix")]
    pub path_prefix: String,
    /// Talk TLS to the authorizer
    #[serde(default)]
    pub tls: bool,
    /// `http` (default) or `grpc`
    #[serde(default)]
    pub proto: String,
    /// Whole-call timeout, humantime syntax
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Whole-call timeout in milliseconds; older spelling
    #[serde(default, alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Extra request headers to forward
    #[serde(default, alias = "allowed_request_headers")]
    pub allowed_request_headers: Vec<String>,
    /// Extra response headers to copy onto the request
    #[serde(default, alias = "allowed_authorization_headers")]
    pub allowed_authorization_headers: Vec<String>,
    /// Forward the request body
    #[serde(default, alias = "include_body")]
    pub include_body: Option<IncludeBody>,
    /// Send `l5d-dst-override`
    #[serde(default, alias = "add_linkerd_headers")]
    pub add_linkerd_headers: bool,
    /// Allow when the authorizer cannot be reached
    #[serde(default, alias = "failure_mode_allow")]
    pub failure_mode_allow: bool,
    /// Deny status when the authorizer cannot be reached
    #[serde(default, alias = "status_on_error")]
    pub status_on_error: StatusOnError,
}

/// Validated external settings.
#[derive(Debug, Clone)]
pub struct ExternalSpec {
    /// `host[:port]`, scheme stripped
    pub auth_service: String,
    /// Prepended to the request path
    pub path_prefix: String,
    /// Talk TLS to the authorizer
    pub tls: bool,
    /// Wire protocol
    pub proto: Proto,
    /// Whole-call timeout
    pub timeout: Duration,
    /// Lowercased, sorted, deduplicated
    pub allowed_request_headers: Vec<String>,
    /// Lowercased, sorted, deduplicated
    pub allowed_authorization_headers: Vec<String>,
    /// Forward the request body
    pub include_body: Option<IncludeBody>,
    /// Send `l5d-dst-override`
    pub add_linkerd_headers: bool,
    /// Allow when the authorizer cannot be reached
    pub failure_mode_allow: bool,
    /// Deny status when the authorizer cannot be reached
    pub status_on_error: StatusCode,
}

/// Always-allowed names plus user entries, lowercased, sorted, unique.
pub fn normalize_headers(always: &[&str], extra: &[String]) -> Vec<String> {
    let mut headers: Vec<String> = always
        .iter()
        .map(|h| (*h).to_string())
        .chain(extra.iter().map(|h| h.to_ascii_lowercase()))
        .collect();
    headers.sort();
    headers.dedup();
    headers
}

impl ExternalSpecRaw {
    /// Check and type the settings.
    pub fn validate(&self) -> Result<ExternalSpec, String> {
        let (auth_service, tls) = if let Some(rest) = self.auth_service.strip_prefix("https://") {
            (rest.to_string(), true)
        } else if let Some(rest) = self.auth_service.strip_prefix("http://") {
            (rest.to_string(), false)
        } else {
            (self.auth_service.clone(), self.tls)
        };
        let auth_service = auth_service.trim_end_matches('/').to_string();
        if auth_service.is_empty() {
            return Err("auth_service is required".to_string());
        }

        let proto = match self.proto.as_str() {
            "" | "http" => Proto::Http,
            "grpc" => Proto::Grpc,
            other => {
                return Err(format!(
                    "proto={other:?} is invalid; valid values are \"http\", \"grpc\""
                ));
            }
        };

        let timeout = match (self.timeout, self.timeout_ms) {
            (Some(t), _) if !t.is_zero() => t,
            (_, Some(ms)) if ms > 0 => Duration::from_millis(ms),
            _ => DEFAULT_TIMEOUT,
        };

        let status_on_error = match self.status_on_error.code {
            0 => StatusCode::FORBIDDEN,
            code => StatusCode::from_u16(code)
                .map_err(|_| format!("status_on_error.code: invalid status {code}"))?,
        };

        Ok(ExternalSpec {
            auth_service,
            path_prefix: self.path_prefix.clone(),
            tls,
            proto,
            timeout,
            allowed_request_headers: normalize_headers(
                ALWAYS_ALLOWED_REQUEST_HEADERS,
                &self.allowed_request_headers,
            ),
            allowed_authorization_headers: normalize_headers(
                ALWAYS_ALLOWED_AUTHORIZATION_HEADERS,
                &self.allowed_authorization_headers,
            ),
            include_body: self.include_body,
            add_linkerd_headers: self.add_linkerd_headers,
            failure_mode_allow: self.failure_mode_allow,
            status_on_error,
        })
    }
}

impl ExternalSpec {
    /// One-line summary for logs.
    pub fn description(&self) -> String {
        format!(
            "external_auth_service={}, proto={}",
            self.auth_service, self.proto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(yaml: &str) -> ExternalSpecRaw {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults() {
        let spec = raw("authService: authz:3000").validate().unwrap();
        assert_eq!(spec.proto, Proto::Http);
        assert_eq!(spec.timeout, DEFAULT_TIMEOUT);
        assert_eq!(spec.status_on_error, StatusCode::FORBIDDEN);
        assert!(!spec.tls);
        assert_eq!(spec.description(), "external_auth_service=authz:3000, proto=http");
    }

    #[test]
    fn scheme_prefix_sets_tls() {
        let spec = raw("authService: https://authz.example:8443").validate().unwrap();
        assert_eq!(spec.auth_service, "authz.example:8443");
        assert!(spec.tls);

        let spec = raw("{authService: 'http://authz', tls: true}").validate().unwrap();
        assert!(!spec.tls);
    }

    #[test]
    fn headers_are_normalized() {
        let spec = raw("{authService: a, allowedRequestHeaders: [X-Tenant, cookie, x-tenant]}")
            .validate()
            .unwrap();
        assert_eq!(
            spec.allowed_request_headers,
            vec![
                "authorization",
                "cookie",
                "from",
                "proxy-authorization",
                "user-agent",
                "x-forwarded-for",
                "x-forwarded-host",
                "x-forwarded-proto",
                "x-tenant",
            ]
        );
    }

    #[test]
    fn snake_case_spellings_are_accepted() {
        let spec = raw(
            "{auth_service: a, timeout_ms: 250, status_on_error: {code: 503}, failure_mode_allow: true, proto: grpc}",
        )
        .validate()
        .unwrap();
        assert_eq!(spec.timeout, Duration::from_millis(250));
        assert_eq!(spec.status_on_error, StatusCode::SERVICE_UNAVAILABLE);
        assert!(spec.failure_mode_allow);
        assert_eq!(spec.proto, Proto::Grpc);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(raw("{}").validate().is_err());
        assert!(raw("{authService: a, proto: tcp}").validate().is_err());
    }
}
