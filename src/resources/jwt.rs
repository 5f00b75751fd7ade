//! JWT filter settings.

use std::str::FromStr;

use http::HeaderName;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{RenegotiateTls, parse_duration};
use crate::filters::template;

/// Accepted when `validAlgorithms` is empty: every signed family.
pub const DEFAULT_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::HS256,
    Algorithm::HS384,
    Algorithm::HS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// A header whose value is rendered from a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderTemplateSpec {
    /// Header name
    pub name: String,
    /// Go-style template
    pub value: String,
}

/// `errorResponse` as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponseSpec {
    /// Response content type
    #[serde(default)]
    pub content_type: String,
    /// Body template
    #[serde(default)]
    pub body_template: String,
    /// Extra headers, templated
    #[serde(default)]
    pub headers: Vec<HeaderTemplateSpec>,
}

/// JWT settings as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtSpecRaw {
    /// Accepted `alg` values
    #[serde(default)]
    pub valid_algorithms: Vec<String>,
    /// Key set URL
    #[serde(rename = "jwksURI", default)]
    pub jwks_uri: String,
    /// Expected `aud`
    #[serde(default)]
    pub audience: String,
    /// `aud` must be present
    #[serde(default)]
    pub require_audience: bool,
    /// Expected `iss`
    #[serde(default)]
    pub issuer: String,
    /// `iss` must be present
    #[serde(default)]
    pub require_issuer: bool,
    /// `iat` must be present
    #[serde(default)]
    pub require_issued_at: bool,
    /// `exp` must be present
    #[serde(default)]
    pub require_expires_at: bool,
    /// `nbf` must be present
    #[serde(default)]
    pub require_not_before: bool,
    /// Headers to add on success
    #[serde(default)]
    pub inject_request_headers: Vec<HeaderTemplateSpec>,
    /// Shape of the 401
    #[serde(default)]
    pub error_response: ErrorResponseSpec,
    /// Skip certificate verification towards the key set host
    #[serde(rename = "insecureTLS", default)]
    pub insecure_tls: bool,
    /// TLS renegotiation towards the key set host
    #[serde(rename = "renegotiateTLS", default)]
    pub renegotiate_tls: String,
    /// Cache staleness allowance for the key set
    #[serde(default)]
    pub max_stale: String,
}

/// A validated header template.
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    /// Header name
    pub name: HeaderName,
    /// Template source, already converted to the renderer's syntax
    pub template: String,
}

/// Validated `errorResponse`.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// Response content type
    pub content_type: String,
    /// Body template, if any
    pub body_template: Option<String>,
    /// Extra headers
    pub headers: Vec<HeaderTemplate>,
}

/// Validated JWT settings.
#[derive(Debug, Clone)]
pub struct JwtSpec {
    /// Signed algorithms accepted
    pub valid_algorithms: Vec<Algorithm>,
    /// Unsigned tokens accepted; only when `none` is the sole entry
    pub allow_unsigned: bool,
    /// Key set URL; absent only with `allow_unsigned`
    pub jwks_uri: Option<Url>,
    /// Expected `aud`
    pub audience: String,
    /// `aud` must be present
    pub require_audience: bool,
    /// Expected `iss`
    pub issuer: String,
    /// `iss` must be present
    pub require_issuer: bool,
    /// `iat` must be present
    pub require_issued_at: bool,
    /// `exp` must be present
    pub require_expires_at: bool,
    /// `nbf` must be present
    pub require_not_before: bool,
    /// Headers to add on success
    pub inject_request_headers: Vec<HeaderTemplate>,
    /// Shape of the 401
    pub error_response: ErrorResponse,
    /// Skip certificate verification towards the key set host
    pub insecure_tls: bool,
    /// TLS renegotiation towards the key set host
    pub renegotiate_tls: RenegotiateTls,
    /// Cache staleness allowance for the key set
    pub max_stale: std::time::Duration,
}

fn header_templates(field: &str, specs: &[HeaderTemplateSpec]) -> Result<Vec<HeaderTemplate>, String> {
    specs
        .iter()
        .map(|h| {
            let name = HeaderName::from_str(&h.name)
                .map_err(|e| format!("{field}: header name {:?}: {e}", h.name))?;
            let template = template::compile(&h.value)
                .map_err(|e| format!("{field}: header {:?}: {e}", h.name))?;
            Ok(HeaderTemplate { name, template })
        })
        .collect()
}

impl JwtSpecRaw {
    /// Check and type the settings.
    pub fn validate(&self) -> Result<JwtSpec, String> {
        let allow_unsigned = self.valid_algorithms.len() == 1 && self.valid_algorithms[0] == "none";

        let valid_algorithms = if self.valid_algorithms.is_empty() {
            DEFAULT_ALGORITHMS.to_vec()
        } else {
            self.valid_algorithms
                .iter()
                .filter(|a| a.as_str() != "none")
                .map(|a| {
                    Algorithm::from_str(a).map_err(|_| format!("validAlgorithms: unknown algorithm {a:?}"))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let jwks_uri = if self.jwks_uri.is_empty() {
            if !allow_unsigned {
                return Err("jwksURI is required unless validAlgorithms is exactly [\"none\"]".to_string());
            }
            None
        } else {
            let url = Url::parse(&self.jwks_uri)
                .map_err(|e| format!("parsing jwksURI: {:?}: {e}", self.jwks_uri))?;
            if !url.has_host() {
                return Err("jwksURI is not an absolute URL".to_string());
            }
            Some(url)
        };

        let body_template = if self.error_response.body_template.is_empty() {
            None
        } else {
            Some(
                template::compile(&self.error_response.body_template)
                    .map_err(|e| format!("errorResponse.bodyTemplate: {e}"))?,
            )
        };
        let content_type = if self.error_response.content_type.is_empty() {
            "application/json".to_string()
        } else {
            self.error_response.content_type.clone()
        };

        Ok(JwtSpec {
            valid_algorithms,
            allow_unsigned,
            jwks_uri,
            audience: self.audience.clone(),
            require_audience: self.require_audience,
            issuer: self.issuer.clone(),
            require_issuer: self.require_issuer,
            require_issued_at: self.require_issued_at,
            require_expires_at: self.require_expires_at,
            require_not_before: self.require_not_before,
            inject_request_headers: header_templates(
                "injectRequestHeaders",
                &self.inject_request_headers,
            )?,
            error_response: ErrorResponse {
                content_type,
                body_template,
                headers: header_templates("errorResponse.headers", &self.error_response.headers)?,
            },
            insecure_tls: self.insecure_tls,
            renegotiate_tls: self.renegotiate_tls.parse()?,
            max_stale: parse_duration("maxStale", &self.max_stale)?,
        })
    }
}

impl JwtSpec {
    /// One-line summary for logs.
    pub fn description(&self) -> String {
        match &self.jwks_uri {
            Some(uri) => format!("jwt_jwks_uri={uri}"),
            None => "jwt_jwks_uri=<none>".to_string(),
        }
    }
}
