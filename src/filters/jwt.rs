//! Bearer JWT validator.
//!
//! Never redirects: a request either carries a token that verifies and
//! gets the configured headers injected, or is answered with an RFC 6750
//! challenge.

use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use filter_api::{
    BoxError, Filter, FilterContext, FilterRequest, FilterResponse, HttpRequestModification,
    HttpResponse,
};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use jsonwebtoken::{Algorithm, Validation, decode};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::FilterDeps;
use super::claims::{self, ClaimError, Claims};
use super::template;
use crate::jwks::{JwksError, fetch_jwks};
use crate::resources::{JwtSpec, QName};

/// Why a presented token was refused.
#[derive(Debug, Error)]
pub enum JwtError {
    /// Not three base64url JSON segments
    #[error("malformed token: {0}")]
    Malformed(String),

    /// `alg` missing, unknown or not accepted
    #[error("{0}")]
    Algorithm(String),

    /// Signed token without `kid`
    #[error("token header has no kid")]
    MissingKid,

    /// Signed token but no key set to check it against
    #[error("no jwksURI configured for signed tokens")]
    NoKeySet,

    /// Key set fetch or key lookup failed
    #[error(transparent)]
    Keys(#[from] JwksError),

    /// Signature did not verify
    #[error("invalid signature: {0}")]
    Signature(jsonwebtoken::errors::Error),

    /// Registered claim check failed
    #[error(transparent)]
    Claims(#[from] ClaimError),
}

/// A token split into its parts; claims are trusted only after
/// [`JwtFilter::validate`] returns it.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    /// The compact serialization as presented
    pub raw: String,
    /// JOSE header
    pub header: Claims,
    /// Claims set
    pub claims: Claims,
    /// Third segment, still encoded
    pub signature: String,
}

fn decode_segment(segment: &str, what: &str) -> Result<Claims, JwtError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| JwtError::Malformed(format!("{what} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| JwtError::Malformed(format!("{what} is not a JSON object: {e}")))
}

/// Split `token` without checking anything but its shape.
pub fn parse_unverified(token: &str) -> Result<ParsedToken, JwtError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header, claims, signature] = parts.as_slice() else {
        return Err(JwtError::Malformed(
            "token contains an invalid number of segments".to_string(),
        ));
    };
    Ok(ParsedToken {
        raw: token.to_string(),
        header: decode_segment(header, "header")?,
        claims: decode_segment(claims, "claims")?,
        signature: (*signature).to_string(),
    })
}

// ============================================================================
// Bearer extraction (RFC 6750 §2.1)
// ============================================================================

/// What the `Authorization` header holds.
#[derive(Debug, PartialEq, Eq)]
pub enum Bearer {
    /// No header, or another auth-scheme
    Missing,
    /// A Bearer header that does not parse
    Malformed(String),
    /// The token
    Token(String),
}

fn is_token68(s: &str) -> bool {
    let body = s.trim_end_matches('=');
    !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-._~+/".contains(&b))
}

/// Read a bearer token from `headers`.
pub fn bearer_token(headers: &HeaderMap) -> Bearer {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Bearer::Missing;
    };
    let Ok(value) = value.to_str() else {
        return Bearer::Malformed("invalid Authorization header: not visible ASCII".to_string());
    };
    let value = value.trim();
    let (scheme, credentials) = value.split_once(' ').unwrap_or((value, ""));
    if scheme.is_empty() {
        return Bearer::Malformed("invalid Authorization header: no auth-scheme".to_string());
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Bearer::Missing;
    }
    let credentials = credentials.trim_start();
    if credentials.is_empty() {
        return Bearer::Malformed("invalid Bearer credentials: empty".to_string());
    }
    if !is_token68(credentials) {
        return Bearer::Malformed(
            "invalid Bearer credentials: used auth-param syntax instead of token68 syntax"
                .to_string(),
        );
    }
    Bearer::Token(credentials.to_string())
}

// ============================================================================
// Filter
// ============================================================================

/// One invocation of a JWT filter.
pub struct JwtFilter<'a> {
    qname: &'a QName,
    spec: &'a JwtSpec,
    deps: &'a FilterDeps,
}

impl<'a> JwtFilter<'a> {
    /// Bind a validated spec.
    pub fn new(qname: &'a QName, spec: &'a JwtSpec, deps: &'a FilterDeps) -> Self {
        Self { qname, spec, deps }
    }

    /// Verify signature and claims.
    pub async fn validate(&self, token: &str) -> Result<ParsedToken, JwtError> {
        let parsed = parse_unverified(token)?;
        let alg = parsed
            .header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| JwtError::Algorithm("token header has no alg".to_string()))?;

        if alg == "none" {
            if !self.spec.allow_unsigned {
                return Err(JwtError::Algorithm(
                    "signing method none is not allowed".to_string(),
                ));
            }
            if !parsed.signature.is_empty() {
                return Err(JwtError::Algorithm(
                    "'none' signing method with non-empty signature".to_string(),
                ));
            }
        } else {
            let alg = Algorithm::from_str(alg)
                .map_err(|_| JwtError::Algorithm(format!("unknown signing method {alg:?}")))?;
            if !self.spec.valid_algorithms.contains(&alg) {
                return Err(JwtError::Algorithm(format!(
                    "signing method {alg:?} is not allowed"
                )));
            }
            let kid = parsed
                .header
                .get("kid")
                .and_then(Value::as_str)
                .ok_or(JwtError::MissingKid)?;
            let jwks_uri = self.spec.jwks_uri.as_ref().ok_or(JwtError::NoKeySet)?;
            let client = self
                .deps
                .http
                .client(self.spec.max_stale, self.spec.insecure_tls);
            let key = fetch_jwks(&client, jwks_uri).await?.get_key(kid)?;

            let mut validation = Validation::new(alg);
            validation.required_spec_claims.clear();
            validation.validate_exp = false;
            validation.validate_nbf = false;
            validation.validate_aud = false;
            decode::<Claims>(token, &key, &validation).map_err(JwtError::Signature)?;
        }

        let c = &parsed.claims;
        claims::verify_times(
            c,
            claims::now(),
            self.spec.require_expires_at,
            self.spec.require_issued_at,
            self.spec.require_not_before,
        )?;
        claims::verify_audience(c, &self.spec.audience, self.spec.require_audience)?;
        claims::verify_issuer(c, &self.spec.issuer, self.spec.require_issuer)?;
        Ok(parsed)
    }

    fn inject(&self, token: &ParsedToken) -> Result<HttpRequestModification, BoxError> {
        let ctx = json!({
            "token": {
                "Raw": token.raw,
                "Header": token.header,
                "Claims": token.claims,
                "Signature": token.signature,
            }
        });
        let mut modification = HttpRequestModification::new();
        for h in &self.spec.inject_request_headers {
            let value = template::render(&h.template, &ctx)?;
            modification = modification.replace(h.name.clone(), HeaderValue::from_str(&value)?);
        }
        Ok(modification)
    }

    fn challenge(&self, ctx: &FilterContext, error: Option<(&str, String)>) -> HttpResponse {
        let realm = quote(&self.qname.to_string());
        let (www_authenticate, code, description) = match &error {
            Some((code, description)) => (
                format!(
                    "Bearer error={code}, error_description={}, realm={realm}",
                    quote(description)
                ),
                *code,
                description.as_str(),
            ),
            None => (
                format!("Bearer realm={realm}"),
                "",
                "no Bearer token",
            ),
        };

        let status = StatusCode::UNAUTHORIZED;
        let body_ctx = json!({
            "httpStatus": status.as_u16(),
            "message": description,
            "errorMessage": description,
            "errorCode": code,
            "requestId": ctx.request_id,
        });

        let mut response = HttpResponse::new(status);
        let error_response = &self.spec.error_response;
        response.body = match &error_response.body_template {
            Some(t) => template::render(t, &body_ctx).unwrap_or_else(|e| {
                warn!(filter = %self.qname, error = %e, "Rendering errorResponse.bodyTemplate");
                String::new()
            }),
            None => json!({"status_code": status.as_u16(), "message": description}).to_string(),
        };
        for h in &error_response.headers {
            match template::render(&h.template, &body_ctx)
                .map_err(BoxError::from)
                .and_then(|v| Ok(HeaderValue::from_str(&v)?))
            {
                Ok(value) => {
                    response.headers.insert(h.name.clone(), value);
                }
                Err(e) => warn!(filter = %self.qname, header = %h.name, error = %e, "Rendering errorResponse header"),
            }
        }
        if let Ok(value) = HeaderValue::from_str(&error_response.content_type) {
            response.headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&www_authenticate) {
            response.headers.insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// RFC 7230 quoted-string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[async_trait]
impl Filter for JwtFilter<'_> {
    async fn filter(
        &self,
        ctx: &FilterContext,
        request: &FilterRequest,
    ) -> Result<FilterResponse, BoxError> {
        let token = match bearer_token(&request.headers) {
            Bearer::Token(token) => token,
            Bearer::Missing => return Ok(self.challenge(ctx, None).into()),
            Bearer::Malformed(reason) => {
                return Ok(self
                    .challenge(ctx, Some(("invalid_request", reason)))
                    .into());
            }
        };

        match self.validate(&token).await {
            Ok(parsed) => Ok(self.inject(&parsed)?.into()),
            Err(e) => {
                if matches!(e, JwtError::Keys(JwksError::Fetch(_))) {
                    warn!(filter = %self.qname, error = %e, "JWKS unavailable");
                } else {
                    debug!(filter = %self.qname, error = %e, "Token rejected");
                }
                Ok(self
                    .challenge(ctx, Some(("invalid_token", e.to_string())))
                    .into())
            }
        }
    }
}
