//! Error types for the authz sidecar

use std::io;

use thiserror::Error;

/// Result type alias for the authz sidecar
pub type Result<T> = std::result::Result<T, Error>;

/// Sidecar errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session keypair could not be loaded or created
    #[error("Keypair error: {0}")]
    Keypair(String),

    /// JWT encode/decode error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Template error
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Transport error (gRPC channel, listener)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
