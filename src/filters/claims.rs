//! Registered-claim checks shared by the JWT and OAuth2 filters.
//!
//! Time claims are compared to the current second with no leeway: a token
//! whose `exp` is one second in the past is expired. An absent claim only
//! fails when the caller requires it.

use serde_json::{Map, Value};
use thiserror::Error;

/// Claims object of a decoded token.
pub type Claims = Map<String, Value>;

/// Why a claim check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// A required claim is absent
    #[error("token is missing required claim {0:?}")]
    Missing(&'static str),

    /// A time claim is not a number
    #[error("claim {0:?} is not a number")]
    NotANumber(&'static str),

    /// `exp` is in the past
    #[error("token is expired")]
    Expired,

    /// `iat` is in the future
    #[error("token used before issued")]
    UsedBeforeIssued,

    /// `nbf` is in the future
    #[error("token is not valid yet")]
    NotValidYet,

    /// `aud` does not name the expected audience
    #[error("token has wrong audience: expected {0:?}")]
    Audience(String),

    /// `iss` is not the expected issuer
    #[error("token has wrong issuer: expected {0:?}")]
    Issuer(String),
}

/// Seconds since the epoch.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn time_claim(claims: &Claims, name: &'static str) -> Result<Option<f64>, ClaimError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or(ClaimError::NotANumber(name)),
        Some(_) => Err(ClaimError::NotANumber(name)),
    }
}

/// `exp`: valid up to and including that second.
pub fn verify_expires_at(claims: &Claims, now: i64, required: bool) -> Result<(), ClaimError> {
    match time_claim(claims, "exp")? {
        None if required => Err(ClaimError::Missing("exp")),
        Some(exp) if (now as f64) > exp => Err(ClaimError::Expired),
        _ => Ok(()),
    }
}

/// `iat`: must not be in the future.
pub fn verify_issued_at(claims: &Claims, now: i64, required: bool) -> Result<(), ClaimError> {
    match time_claim(claims, "iat")? {
        None if required => Err(ClaimError::Missing("iat")),
        Some(iat) if (now as f64) < iat => Err(ClaimError::UsedBeforeIssued),
        _ => Ok(()),
    }
}

/// `nbf`: must not be in the future.
pub fn verify_not_before(claims: &Claims, now: i64, required: bool) -> Result<(), ClaimError> {
    match time_claim(claims, "nbf")? {
        None if required => Err(ClaimError::Missing("nbf")),
        Some(nbf) if (now as f64) < nbf => Err(ClaimError::NotValidYet),
        _ => Ok(()),
    }
}

/// `exp`, `iat` and `nbf`, each checked when present.
pub fn verify_times(
    claims: &Claims,
    now: i64,
    require_exp: bool,
    require_iat: bool,
    require_nbf: bool,
) -> Result<(), ClaimError> {
    verify_expires_at(claims, now, require_exp)?;
    verify_issued_at(claims, now, require_iat)?;
    verify_not_before(claims, now, require_nbf)
}

/// `aud` must contain `expected`. Skipped when nothing is expected and
/// nothing is required; an absent claim fails only when required.
pub fn verify_audience(claims: &Claims, expected: &str, required: bool) -> Result<(), ClaimError> {
    if expected.is_empty() && !required {
        return Ok(());
    }
    let matches = match claims.get("aud") {
        None | Some(Value::Null) => return absent("aud", required),
        Some(Value::String(aud)) if aud.is_empty() => return absent("aud", required),
        Some(Value::String(aud)) => aud == expected,
        Some(Value::Array(auds)) if auds.is_empty() => return absent("aud", required),
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expected)),
        Some(_) => false,
    };
    if matches {
        Ok(())
    } else {
        Err(ClaimError::Audience(expected.to_string()))
    }
}

/// `iss` must equal `expected`; same presence rules as [`verify_audience`].
pub fn verify_issuer(claims: &Claims, expected: &str, required: bool) -> Result<(), ClaimError> {
    if expected.is_empty() && !required {
        return Ok(());
    }
    match claims.get("iss") {
        None | Some(Value::Null) => absent("iss", required),
        Some(Value::String(iss)) if iss.is_empty() => absent("iss", required),
        Some(Value::String(iss)) if iss == expected => Ok(()),
        Some(_) => Err(ClaimError::Issuer(expected.to_string())),
    }
}

fn absent(name: &'static str, required: bool) -> Result<(), ClaimError> {
    if required {
        Err(ClaimError::Missing(name))
    } else {
        Ok(())
    }
}

/// Scope values granted by a token: a space-separated `scope` string, or
/// an array of strings.
pub fn scopes(claims: &Claims) -> Vec<String> {
    match claims.get("scope") {
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
