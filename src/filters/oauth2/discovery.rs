//! OpenID Provider discovery.
//!
//! Both documents go through the cached client, so a hot filter costs no
//! network round-trips until the IdP's cache headers run out.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::httpclient::{FetchError, HttpClient};
use crate::jwks::{JwkSet, JwksError, fetch_jwks};
use crate::resources::OAuth2Spec;

/// Endpoints the filter needs from the provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    /// Expected `iss` of access tokens
    #[serde(default)]
    pub issuer: String,
    /// Where the user agent is sent to log in
    pub authorization_endpoint: Url,
    /// Code exchange endpoint
    pub token_endpoint: Url,
    /// Signing keys
    pub jwks_uri: Url,
    /// Opaque token check
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    /// RP-initiated logout
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
}

/// Discovery failures. All of them deny with 401.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `authorizationURL` does not yield a discovery URL
    #[error("building discovery URL: {0}")]
    Url(#[from] url::ParseError),

    /// Provider configuration could not be fetched
    #[error("fetching provider configuration: {0}")]
    Fetch(#[from] FetchError),

    /// Key set could not be fetched
    #[error(transparent)]
    Jwks(#[from] JwksError),
}

/// Fetch the provider configuration only.
pub async fn discover_config(client: &HttpClient, spec: &OAuth2Spec) -> Result<Discovery, DiscoveryError> {
    let url = spec.discovery_url()?;
    let config: Discovery = client.get_json(&url).await?;
    debug!(
        issuer = %config.issuer,
        authorization_endpoint = %config.authorization_endpoint,
        "OpenID configuration"
    );
    Ok(config)
}

/// Fetch the provider configuration and its key set.
pub async fn discover(
    client: &HttpClient,
    spec: &OAuth2Spec,
) -> Result<(Discovery, JwkSet), DiscoveryError> {
    let config = discover_config(client, spec).await?;
    let keys = fetch_jwks(client, &config.jwks_uri).await?;
    Ok((config, keys))
}
