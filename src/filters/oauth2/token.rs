//! Access token checks and the authorization-code exchange.

use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use super::discovery::Discovery;
use crate::filters::claims::{self, ClaimError, Claims};
use crate::httpclient::HttpClient;
use crate::jwks::{JwkSet, JwksError};
use crate::resources::{AccessTokenValidation, OAuth2Spec};

const RSA_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Why an access token was not accepted.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Not a JWT
    #[error("token is not a JWT: {0}")]
    Malformed(jsonwebtoken::errors::Error),

    /// Signed with something other than RSA
    #[error("unexpected signing method {0:?}")]
    Algorithm(Algorithm),

    /// Header has no `kid`
    #[error("token header has no kid")]
    MissingKid,

    /// `kid` does not resolve
    #[error(transparent)]
    Key(#[from] JwksError),

    /// Signature did not verify
    #[error("invalid token: {0}")]
    Signature(jsonwebtoken::errors::Error),

    /// Registered claim check failed
    #[error(transparent)]
    Claims(#[from] ClaimError),

    /// Token grants a scope the rule does not allow
    #[error("token scope {0:?} is not in the rule's scopes")]
    Scope(String),

    /// Provider advertises no userinfo endpoint
    #[error("provider has no userinfo_endpoint")]
    NoUserinfoEndpoint,

    /// Userinfo request failed
    #[error("userinfo request: {0}")]
    Userinfo(#[from] reqwest::Error),

    /// Userinfo rejected the token
    #[error("userinfo answered {0}")]
    UserinfoStatus(http::StatusCode),
}

/// Check `token` the way the filter's `accessTokenValidation` says.
pub async fn validate_access_token(
    client: &HttpClient,
    spec: &OAuth2Spec,
    discovery: &Discovery,
    keys: &JwkSet,
    scopes: &[String],
    token: &str,
) -> Result<(), TokenError> {
    match spec.access_token_validation {
        AccessTokenValidation::Jwt => validate_jwt(spec, discovery, keys, scopes, token),
        AccessTokenValidation::Userinfo => validate_userinfo(client, discovery, token).await,
        AccessTokenValidation::Auto => {
            if decode_header(token).is_ok() {
                validate_jwt(spec, discovery, keys, scopes, token)
            } else {
                validate_userinfo(client, discovery, token).await
            }
        }
    }
}

/// Signature against the provider's keys, then claims, then scopes.
pub fn validate_jwt(
    spec: &OAuth2Spec,
    discovery: &Discovery,
    keys: &JwkSet,
    scopes: &[String],
    token: &str,
) -> Result<(), TokenError> {
    let header = decode_header(token).map_err(TokenError::Malformed)?;
    if !RSA_ALGORITHMS.contains(&header.alg) {
        return Err(TokenError::Algorithm(header.alg));
    }
    let kid = header.kid.ok_or(TokenError::MissingKid)?;
    let key = keys.get_key(&kid)?;

    let mut validation = Validation::new(header.alg);
    validation.algorithms = RSA_ALGORITHMS.to_vec();
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    let claims = decode::<Claims>(token, &key, &validation)
        .map_err(TokenError::Signature)?
        .claims;

    claims::verify_audience(&claims, &spec.audience, false)?;
    claims::verify_issuer(&claims, &discovery.issuer, false)?;
    claims::verify_times(&claims, claims::now(), false, false, false)?;

    for scope in claims::scopes(&claims) {
        if !scopes.contains(&scope) {
            return Err(TokenError::Scope(scope));
        }
    }
    Ok(())
}

async fn validate_userinfo(
    client: &HttpClient,
    discovery: &Discovery,
    token: &str,
) -> Result<(), TokenError> {
    let endpoint = discovery
        .userinfo_endpoint
        .as_ref()
        .ok_or(TokenError::NoUserinfoEndpoint)?;
    let response = client.get_with_bearer(endpoint, token).await?;
    if response.status.is_success() {
        Ok(())
    } else {
        Err(TokenError::UserinfoStatus(response.status))
    }
}

// ============================================================================
// Code exchange
// ============================================================================

/// Token endpoint answer (RFC 6749 §5.1).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The token to set in the cookie
    pub access_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Not used
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
}

/// Exchange failures; the filter answers 401 for all of them.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Token endpoint unreachable
    #[error("token request: {0}")]
    Http(#[from] reqwest::Error),

    /// Token endpoint refused
    #[error("token endpoint answered {status}: {body}")]
    Status {
        /// Returned status
        status: http::StatusCode,
        /// Returned body, for the log
        body: String,
    },

    /// Body was not a token response
    #[error("parsing token response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Trade an authorization code for an access token.
pub async fn exchange_code(
    client: &HttpClient,
    token_endpoint: &Url,
    spec: &OAuth2Spec,
    code: &str,
) -> Result<TokenResponse, ExchangeError> {
    let response = client
        .post_form(
            token_endpoint,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", &spec.client_id),
                ("code", code),
                ("redirect_uri", spec.callback_url.as_str()),
                ("client_secret", &spec.secret),
            ],
        )
        .await?;
    if !response.status.is_success() {
        return Err(ExchangeError::Status {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }
    Ok(serde_json::from_slice(&response.body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::Jwk;
    use crate::resources::OAuth2SpecRaw;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
    use rsa::traits::PublicKeyParts;
    use std::sync::OnceLock;

    struct Idp {
        signer: EncodingKey,
        keys: JwkSet,
    }

    fn idp() -> &'static Idp {
        static IDP: OnceLock<Idp> = OnceLock::new();
        IDP.get_or_init(|| {
            let private = rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 2048).unwrap();
            let pem = private.to_pkcs1_pem(LineEnding::LF).unwrap();
            let jwk = Jwk {
                kid: Some("k1".to_string()),
                kty: "RSA".to_string(),
                x5c: Vec::new(),
                n: Some(URL_SAFE_NO_PAD.encode(private.n().to_bytes_be())),
                e: Some(URL_SAFE_NO_PAD.encode(private.e().to_bytes_be())),
                x: None,
                y: None,
                crv: None,
            };
            Idp {
                signer: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
                keys: JwkSet::from_keys(vec![jwk]),
            }
        })
    }

    fn spec() -> OAuth2Spec {
        OAuth2SpecRaw {
            authorization_url: "https://idp.example".to_string(),
            client_url: "https://app.example".to_string(),
            client_id: "c".to_string(),
            secret: "s".to_string(),
            audience: "api".to_string(),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn discovery() -> Discovery {
        Discovery {
            issuer: "https://idp.example".to_string(),
            authorization_endpoint: Url::parse("https://idp.example/authorize").unwrap(),
            token_endpoint: Url::parse("https://idp.example/token").unwrap(),
            jwks_uri: Url::parse("https://idp.example/jwks").unwrap(),
            userinfo_endpoint: None,
            end_session_endpoint: None,
        }
    }

    fn token(claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("k1".to_string());
        encode(&header, &claims, &idp().signer).unwrap()
    }

    fn scopes(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn valid_token_passes() {
        let t = token(serde_json::json!({
            "iss": "https://idp.example",
            "aud": "api",
            "exp": claims::now() + 60,
            "scope": "openid profile",
        }));
        validate_jwt(&spec(), &discovery(), &idp().keys, &scopes(&["openid", "profile", "email"]), &t)
            .unwrap();
    }

    #[test]
    fn extra_token_scope_is_rejected() {
        let t = token(serde_json::json!({"scope": "openid admin"}));
        let err = validate_jwt(&spec(), &discovery(), &idp().keys, &scopes(&["openid"]), &t).unwrap_err();
        assert!(matches!(err, TokenError::Scope(s) if s == "admin"));
    }

    #[test]
    fn wrong_issuer_or_audience_is_rejected() {
        let t = token(serde_json::json!({"iss": "https://other"}));
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::Claims(ClaimError::Issuer(_)))
        ));
        let t = token(serde_json::json!({"aud": "web"}));
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::Claims(ClaimError::Audience(_)))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let t = token(serde_json::json!({"exp": claims::now() - 1}));
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::Claims(ClaimError::Expired))
        ));
    }

    #[test]
    fn missing_kid_and_unknown_kid_are_rejected() {
        let t = encode(&Header::new(Algorithm::RS256), &serde_json::json!({}), &idp().signer).unwrap();
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::MissingKid)
        ));

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("k2".to_string());
        let t = encode(&header, &serde_json::json!({}), &idp().signer).unwrap();
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::Key(JwksError::UnknownKid(_)))
        ));
    }

    #[test]
    fn hmac_token_is_rejected() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let t = encode(&header, &serde_json::json!({}), &EncodingKey::from_secret(b"s")).unwrap();
        assert!(matches!(
            validate_jwt(&spec(), &discovery(), &idp().keys, &[], &t),
            Err(TokenError::Algorithm(Algorithm::HS256))
        ));
    }
}
