//! Process configuration
//!
//! Loaded from an optional YAML file, then overridden by `AUTHZ_SIDECAR_`
//! environment variables (`__` separates nesting levels, e.g.
//! `AUTHZ_SIDECAR_SERVER__HTTP_PORT=9000`).
//!
//! Filters and rules are NOT part of this file: they live in the policy
//! document (see [`crate::resources`]) which is watched and hot-swapped.

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Size of one filter's share of the HTTP cache (discovery + JWKS).
pub const CACHE_BYTES_PER_FILTER: usize = 8 * 1024;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Session keypair storage
    pub keys: KeysConfig,
    /// Policy document source
    pub policy: PolicyConfig,
    /// Outbound HTTP client
    pub http_client: HttpClientConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// HTTP ext_authz + OAuth2 endpoints
    pub http_port: u16,
    /// gRPC ext_authz v3; `None` disables it
    pub grpc_port: Option<u16>,
    /// Per-request deadline handed to filters
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Soft shutdown: stop accepting, drain in-flight requests
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Hard shutdown: abort whatever is left after this
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body forwarded to filters (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8500,
            grpc_port: Some(8501),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// Session keypair storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Directory shared by all replicas
    pub directory: PathBuf,
    /// Fixed object name the keypair is stored under
    pub name: String,
    /// RSA modulus size
    pub bits: usize,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/run/authz-sidecar/keys"),
            name: "authz-sidecar-keys".to_string(),
            bits: 2048,
        }
    }
}

/// Policy document source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// YAML document with `filters` and `policies`
    pub path: PathBuf,
    /// Reload on change
    pub watch: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("policy.yaml"),
            watch: true,
        }
    }
}

/// Outbound HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Timeout for discovery, JWKS and token-exchange requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Cache capacity before any filter is loaded (bytes)
    pub default_cache_size: usize,
    /// Cache capacity added per configured filter (bytes)
    pub cache_size_per_filter: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            default_cache_size: CACHE_BYTES_PER_FILTER,
            cache_size_per_filter: CACHE_BYTES_PER_FILTER,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHZ_SIDECAR_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.keys.bits < 2048 {
            return Err(Error::Config(format!(
                "keys.bits must be at least 2048, got {}",
                self.keys.bits
            )));
        }
        if self.server.shutdown_timeout < self.server.shutdown_grace {
            return Err(Error::Config(
                "server.shutdown_timeout must not be shorter than server.shutdown_grace".to_string(),
            ));
        }
        Ok(())
    }
}
