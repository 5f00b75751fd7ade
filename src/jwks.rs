//! JSON Web Key Set resolution.
//!
//! Key sets are fetched through the cached [`HttpClient`], so repeated
//! lookups for the same IdP are served from memory until the IdP's
//! `Cache-Control` says otherwise.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::httpclient::{FetchError, HttpClient};

/// Key resolution failures.
#[derive(Debug, Error)]
pub enum JwksError {
    /// The key set could not be fetched or parsed
    #[error("fetching JWKS: {0}")]
    Fetch(#[from] FetchError),

    /// No key with this id in the set
    #[error("no JWK with kid {0:?}")]
    UnknownKid(String),

    /// The key carries neither a certificate chain nor usable parameters
    #[error("JWK {0:?} has no usable key material")]
    NoKeyMaterial(String),

    /// Key material is present but malformed
    #[error("JWK {kid:?}: {reason}")]
    InvalidKey {
        /// Key id
        kid: String,
        /// What went wrong
        reason: String,
    },
}

/// One entry of a key set; only the members needed to build a verifier.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key id
    pub kid: Option<String>,
    /// Key type (`RSA`, `EC`)
    #[serde(default)]
    pub kty: String,
    /// Certificate chain, leaf first, standard base64 DER
    #[serde(default)]
    pub x5c: Vec<String>,
    /// RSA modulus
    pub n: Option<String>,
    /// RSA exponent
    pub e: Option<String>,
    /// EC x coordinate
    pub x: Option<String>,
    /// EC y coordinate
    pub y: Option<String>,
    /// EC curve
    pub crv: Option<String>,
}

#[derive(Deserialize)]
struct RawSet {
    #[serde(default)]
    keys: Vec<Jwk>,
}

/// Key set indexed by `kid`.
#[derive(Debug, Clone, Default)]
pub struct JwkSet {
    keys: HashMap<String, Jwk>,
}

impl JwkSet {
    /// Index the keys of a parsed set; entries without a `kid` are dropped.
    pub fn from_keys(keys: Vec<Jwk>) -> Self {
        let keys = keys
            .into_iter()
            .filter_map(|k| k.kid.clone().map(|kid| (kid, k)))
            .collect();
        Self { keys }
    }

    /// Number of addressable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no key has a `kid`.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Public key for `kid`.
    ///
    /// The leaf of `x5c` wins over raw parameters; RSA `n`/`e` are tried
    /// next, then EC `x`/`y`.
    pub fn get_key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        let jwk = self
            .keys
            .get(kid)
            .ok_or_else(|| JwksError::UnknownKid(kid.to_string()))?;
        let invalid = |reason: String| JwksError::InvalidKey {
            kid: kid.to_string(),
            reason,
        };

        if let Some(leaf) = jwk.x5c.first() {
            let der = STANDARD
                .decode(leaf)
                .map_err(|e| invalid(format!("x5c is not base64: {e}")))?;
            let (_, cert) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| invalid(format!("x5c is not a certificate: {e}")))?;
            let spki = cert.public_key().subject_public_key.data.as_ref();
            return Ok(if jwk.kty == "EC" {
                DecodingKey::from_ec_der(spki)
            } else {
                DecodingKey::from_rsa_der(spki)
            });
        }

        if let (Some(n), Some(e)) = (&jwk.n, &jwk.e) {
            return DecodingKey::from_rsa_components(n, e).map_err(|e| invalid(e.to_string()));
        }

        if let (Some(x), Some(y)) = (&jwk.x, &jwk.y) {
            return DecodingKey::from_ec_components(x, y).map_err(|e| invalid(e.to_string()));
        }

        Err(JwksError::NoKeyMaterial(kid.to_string()))
    }
}

/// Fetch and index the key set at `uri`.
pub async fn fetch_jwks(client: &HttpClient, uri: &Url) -> Result<JwkSet, JwksError> {
    let raw: RawSet = client.get_json(uri).await?;
    let total = raw.keys.len();
    let set = JwkSet::from_keys(raw.keys);
    if set.len() < total {
        debug!(url = %uri, skipped = total - set.len(), "JWKS entries without kid ignored");
    }
    Ok(set)
}
