//! OAuth2 filter settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{RenegotiateTls, parse_duration};
use super::policy::{HeaderSelector, HeaderSelectorSpec};

/// State tokens live this long unless `stateTTL` says otherwise.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(5 * 60);

/// Authorization request parameters the filter always sets itself.
const CORE_AUTHORIZATION_PARAMETERS: &[&str] =
    &["response_type", "client_id", "redirect_uri", "scope", "state"];

/// How access tokens presented to the filter are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessTokenValidation {
    /// JWT validation when the token looks like a JWT, else userinfo
    #[default]
    Auto,
    /// Signature and claims, against the IdP's JWKS
    Jwt,
    /// Ask the IdP's userinfo endpoint
    Userinfo,
}

/// OAuth2 settings as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2SpecRaw {
    /// IdP base URL; discovery lives under it
    #[serde(rename = "authorizationURL", default)]
    pub authorization_url: String,
    /// Origin of the protected application
    #[serde(rename = "clientURL", default)]
    pub client_url: String,
    /// State token lifetime, Go duration syntax
    #[serde(rename = "stateTTL", default)]
    pub state_ttl: String,
    /// `audience` authorization parameter and expected `aud`
    #[serde(default)]
    pub audience: String,
    /// OAuth client id
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    /// OAuth client secret
    #[serde(default)]
    pub secret: String,
    /// Stale cache entries may be served this long past expiry
    #[serde(default)]
    pub max_stale: String,
    /// Skip certificate verification towards the IdP
    #[serde(rename = "insecureTLS", default)]
    pub insecure_tls: bool,
    /// TLS renegotiation towards the IdP
    #[serde(rename = "renegotiateTLS", default)]
    pub renegotiate_tls: String,
    /// Extra authorization request parameters
    #[serde(default)]
    pub extra_authorization_parameters: BTreeMap<String, String>,
    /// `auto`, `jwt` or `userinfo`
    #[serde(default)]
    pub access_token_validation: String,
}

/// Validated OAuth2 settings.
#[derive(Debug, Clone)]
pub struct OAuth2Spec {
    /// IdP base URL
    pub authorization_url: Url,
    /// Application origin
    pub client_url: Url,
    /// `clientURL/callback`
    pub callback_url: Url,
    /// Host of `clientURL`
    pub domain: String,
    /// `clientURL` is https; cookies get `Secure`
    pub tls: bool,
    /// State token lifetime
    pub state_ttl: Duration,
    /// Expected `aud`
    pub audience: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub secret: String,
    /// Cache staleness allowance
    pub max_stale: Duration,
    /// Skip certificate verification towards the IdP
    pub insecure_tls: bool,
    /// TLS renegotiation towards the IdP
    pub renegotiate_tls: RenegotiateTls,
    /// Extra authorization request parameters
    pub extra_authorization_parameters: BTreeMap<String, String>,
    /// Access token check
    pub access_token_validation: AccessTokenValidation,
}

fn absolute_url(field: &str, raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("parsing {field}: {raw:?}: {e}"))?;
    if !url.has_host() {
        return Err(format!("{field} is not an absolute URL"));
    }
    Ok(url)
}

impl OAuth2SpecRaw {
    /// Check and type the settings.
    pub fn validate(&self) -> Result<OAuth2Spec, String> {
        let authorization_url = absolute_url("authorizationURL", &self.authorization_url)?;
        let client_url = absolute_url("clientURL", &self.client_url)?;
        let callback_url = Url::parse(&format!(
            "{}/callback",
            client_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| format!("deriving callback URL: {e}"))?;

        let state_ttl = match parse_duration("stateTTL", &self.state_ttl)? {
            Duration::ZERO => DEFAULT_STATE_TTL,
            ttl => ttl,
        };
        let max_stale = parse_duration("maxStale", &self.max_stale)?;
        let renegotiate_tls = self.renegotiate_tls.parse::<RenegotiateTls>()?;

        if self.client_id.is_empty() {
            return Err("clientID is required".to_string());
        }
        if self.secret.is_empty() {
            return Err("secret is required".to_string());
        }

        for key in self.extra_authorization_parameters.keys() {
            if CORE_AUTHORIZATION_PARAMETERS.contains(&key.as_str()) {
                return Err(format!(
                    "extraAuthorizationParameters: may not manually specify built-in OAuth parameter {key:?}"
                ));
            }
        }

        let access_token_validation = match self.access_token_validation.as_str() {
            "" | "auto" => AccessTokenValidation::Auto,
            "jwt" => AccessTokenValidation::Jwt,
            "userinfo" => AccessTokenValidation::Userinfo,
            other => {
                return Err(format!(
                    "accessTokenValidation={other:?} is invalid; valid values are \"auto\", \"jwt\", \"userinfo\""
                ));
            }
        };

        Ok(OAuth2Spec {
            domain: client_url.host_str().unwrap_or_default().to_string(),
            tls: client_url.scheme() == "https",
            authorization_url,
            client_url,
            callback_url,
            state_ttl,
            audience: self.audience.clone(),
            client_id: self.client_id.clone(),
            secret: self.secret.clone(),
            max_stale,
            insecure_tls: self.insecure_tls,
            renegotiate_tls,
            extra_authorization_parameters: self.extra_authorization_parameters.clone(),
            access_token_validation,
        })
    }
}

impl OAuth2Spec {
    /// One-line summary for logs.
    pub fn description(&self) -> String {
        format!(
            "oauth2_domain={}, oauth2_client_id={}",
            self.domain, self.client_id
        )
    }

    /// `authorizationURL/.well-known/openid-configuration`
    pub fn discovery_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}/.well-known/openid-configuration",
            self.authorization_url.as_str().trim_end_matches('/')
        ))
    }
}

// ============================================================================
// Per-reference arguments
// ============================================================================

/// Arguments a rule passes to an OAuth2 filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2ArgumentsRaw {
    /// Requested and accepted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Newer spelling of `scopes`
    #[serde(default)]
    pub scope: Vec<String>,
    /// Answer with a status instead of redirecting, for matching requests
    #[serde(default)]
    pub instead_of_redirect: Option<InsteadOfRedirectRaw>,
}

/// `insteadOfRedirect` as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsteadOfRedirectRaw {
    /// Requests this applies to
    #[serde(default)]
    pub if_request_header: HeaderSelectorSpec,
    /// Status to answer with; default 403
    #[serde(default)]
    pub http_status_code: Option<u16>,
}

/// Validated OAuth2 arguments.
#[derive(Debug, Clone, Default)]
pub struct OAuth2Arguments {
    /// Scopes, in request order
    pub scopes: Vec<String>,
    /// Status answer in place of the redirect
    pub instead_of_redirect: Option<InsteadOfRedirect>,
}

/// Validated `insteadOfRedirect`.
#[derive(Debug, Clone)]
pub struct InsteadOfRedirect {
    /// Requests this applies to
    pub if_request_header: HeaderSelector,
    /// Status to answer with
    pub status: http::StatusCode,
}

impl OAuth2Arguments {
    /// Parse a reference's opaque arguments; `null` means none.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let raw: OAuth2ArgumentsRaw = serde_json::from_value(value.clone())
            .map_err(|e| format!("invalid OAuth2 arguments: {e}"))?;

        let mut scopes = raw.scope;
        scopes.extend(raw.scopes);

        let instead_of_redirect = match raw.instead_of_redirect {
            None => None,
            Some(ior) => {
                let code = ior.http_status_code.unwrap_or(403);
                let status = http::StatusCode::from_u16(code)
                    .map_err(|_| format!("insteadOfRedirect.httpStatusCode: invalid status {code}"))?;
                let if_request_header = HeaderSelector::compile(&ior.if_request_header)
                    .map_err(|e| format!("insteadOfRedirect: {e}"))?;
                Some(InsteadOfRedirect {
                    if_request_header,
                    status,
                })
            }
        };

        Ok(Self {
            scopes,
            instead_of_redirect,
        })
    }
}
