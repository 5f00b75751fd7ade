//! Authorization sidecar for API gateways
//!
//! The gateway asks, for every incoming request, whether it may proceed.
//! The sidecar picks the rule matching the request's host and path and runs
//! the rule's filters in order:
//!
//! - **OAuth2**: authorization-code client; redirects to the IdP, handles
//!   `/callback`, keeps the access token in a cookie.
//! - **JWT**: bearer token validation against a JWKS, with header injection.
//! - **External**: delegates to another authorizer over HTTP or ext_authz gRPC.
//! - **Plugin**: an in-process [`filter_api::Filter`] registered by name.
//! - **Internal**: allows.
//!
//! Checks arrive over HTTP (the original request is forwarded) or gRPC
//! (Envoy `ext_authz` v3). Filters and rules come from a YAML policy file
//! that is hot-reloaded.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod extauthz;
pub mod filters;
pub mod httpclient;
pub mod jwks;
pub mod keypair;
pub mod resources;
pub mod server;
pub mod snapshot;
pub mod watcher;

pub use error::{Error, Result};
pub use evaluator::FilterMux;
pub use filter_api;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    result.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
