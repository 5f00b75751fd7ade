//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Auth sidecar for API gateways: OAuth2, JWT and delegated ext_authz
#[derive(Parser, Debug)]
#[command(name = "authz-sidecar")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHZ_SIDECAR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "AUTHZ_SIDECAR_HOST")]
    pub host: Option<String>,

    /// HTTP ext_authz port
    #[arg(long, env = "AUTHZ_SIDECAR_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// gRPC ext_authz port
    #[arg(long, env = "AUTHZ_SIDECAR_GRPC_PORT")]
    pub grpc_port: Option<u16>,

    /// Policy document (filters and rules)
    #[arg(long, env = "AUTHZ_SIDECAR_POLICY")]
    pub policy: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTHZ_SIDECAR_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHZ_SIDECAR_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the sidecar (default)
    Serve,

    /// Check a policy document and print each filter's status
    Validate {
        /// Path to the policy YAML file
        #[arg(required = true)]
        file: PathBuf,
    },
}
