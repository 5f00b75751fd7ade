//! Signed `state` for the authorization-code leg.
//!
//! The state is an RS256 JWT signed with the process keypair, carrying the
//! URL the user originally asked for. Its `exp` is the only replay guard.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::filters::claims::{self, Claims, ClaimError};
use crate::keypair::Keypair;

const RSA_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Claims of a state token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateClaims {
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Unique token id
    pub jti: String,
    /// Issue time
    pub iat: i64,
    /// Always zero
    pub nbf: i64,
    /// Where to send the user after the callback
    pub redirect_url: String,
}

/// Why a state was rejected.
#[derive(Debug, Error)]
pub enum StateError {
    /// Not a three-part JWT
    #[error("malformed state: {0}")]
    Malformed(String),

    /// Unsigned, or signed with something other than RSA
    #[error("unexpected signing method {0:?}")]
    Algorithm(Algorithm),

    /// Signature or structure did not verify
    #[error("invalid state: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// Expired or not yet valid
    #[error("invalid state: {0}")]
    Claims(#[from] ClaimError),

    /// No usable `redirect_url`
    #[error("state has no valid redirect_url")]
    MissingRedirect,
}

impl StateError {
    /// Structural problems the client can only have caused by tampering
    /// with the query string.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Sign a state for `redirect_url`, valid for `ttl`.
pub fn sign_state(
    keypair: &Keypair,
    redirect_url: &Url,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let iat = claims::now();
    let claims = StateClaims {
        exp: iat + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX - iat),
        jti: uuid::Uuid::new_v4().to_string(),
        iat,
        nbf: 0,
        redirect_url: redirect_url.to_string(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, keypair.encoding_key())
}

/// Verify a state and return its `redirect_url`.
pub fn check_state(state: &str, keypair: &Keypair) -> Result<Url, StateError> {
    if state.is_empty() {
        return Err(StateError::Malformed("empty state".to_string()));
    }
    if state.split('.').count() != 3 {
        return Err(StateError::Malformed("not a JWT".to_string()));
    }
    let header = decode_header(state).map_err(|e| StateError::Malformed(e.to_string()))?;
    if !RSA_ALGORITHMS.contains(&header.alg) {
        return Err(StateError::Algorithm(header.alg));
    }

    let mut validation = Validation::new(header.alg);
    validation.algorithms = RSA_ALGORITHMS.to_vec();
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;

    let token = decode::<Claims>(state, keypair.decoding_key(), &validation)?;
    claims::verify_times(&token.claims, claims::now(), true, false, false)?;

    token
        .claims
        .get("redirect_url")
        .and_then(|v| v.as_str())
        .and_then(|s| Url::parse(s).ok())
        .ok_or(StateError::MissingRedirect)
}

/// Read `redirect_url` without verifying anything. Only for choosing the
/// rule of a callback request; the filter itself calls [`check_state`].
pub fn peek_redirect_url(state: &str) -> Option<Url> {
    let mut parts = state.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Url::parse(claims.get("redirect_url")?.as_str()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn keypair() -> &'static Keypair {
        static KEYPAIR: OnceLock<Keypair> = OnceLock::new();
        KEYPAIR.get_or_init(|| Keypair::generate(2048).unwrap())
    }

    fn signed(claims: serde_json::Value, alg: Algorithm) -> String {
        encode(&Header::new(alg), &claims, keypair().encoding_key()).unwrap()
    }

    #[test]
    fn sign_then_check_round_trips() {
        let target = Url::parse("https://app.example/secure?x=1").unwrap();
        let state = sign_state(keypair(), &target, Duration::from_secs(300)).unwrap();
        assert_eq!(check_state(&state, keypair()).unwrap(), target);
        assert_eq!(peek_redirect_url(&state), Some(target));
    }

    #[test]
    fn expired_one_second_ago_is_rejected() {
        let now = claims::now();
        let state = signed(
            serde_json::json!({"exp": now - 1, "iat": now - 10, "nbf": 0, "jti": "j", "redirect_url": "https://a/"}),
            Algorithm::RS256,
        );
        assert!(matches!(
            check_state(&state, keypair()),
            Err(StateError::Claims(ClaimError::Expired))
        ));
    }

    #[test]
    fn state_without_exp_is_rejected() {
        let state = signed(serde_json::json!({"redirect_url": "https://a/"}), Algorithm::RS256);
        assert!(matches!(
            check_state(&state, keypair()),
            Err(StateError::Claims(ClaimError::Missing("exp")))
        ));
    }

    #[test]
    fn non_rsa_state_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(r#"{"redirect_url":"https://a/"}"#);
        let state = format!("{header}.{claims}.c2ln");
        let err = check_state(&state, keypair()).unwrap_err();
        assert!(matches!(err, StateError::Algorithm(Algorithm::HS256)));
        assert!(!err.is_malformed());
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let target = Url::parse("https://app.example/").unwrap();
        let state = sign_state(keypair(), &target, Duration::from_secs(300)).unwrap();
        let mut parts: Vec<&str> = state.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"exp": claims::now() + 60, "redirect_url": "https://evil/"}).to_string(),
        );
        parts[1] = &forged;
        assert!(matches!(
            check_state(&parts.join("."), keypair()),
            Err(StateError::Invalid(_))
        ));
    }

    #[test]
    fn missing_redirect_is_rejected() {
        let state = signed(
            serde_json::json!({"exp": claims::now() + 60}),
            Algorithm::RS256,
        );
        assert!(matches!(
            check_state(&state, keypair()),
            Err(StateError::MissingRedirect)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(check_state("", keypair()).unwrap_err().is_malformed());
        assert!(check_state("abc", keypair()).unwrap_err().is_malformed());
        assert_eq!(peek_redirect_url("abc"), None);
        assert_eq!(peek_redirect_url("a.b.c"), None);
    }
}
