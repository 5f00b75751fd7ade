//! authz-sidecar - auth sidecar for API gateways

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use authz_sidecar::{
    cli::{Cli, Command},
    config::Config,
    filters::PluginRegistry,
    resources::PolicyDocument,
    server::Server,
    setup_tracing,
    snapshot::build_snapshot,
};

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command.take() {
        Some(Command::Validate { file }) => match run_validate(&file).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                eprintln!("{e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => match run_server(cli).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Print every filter's description or error; true when all are valid.
async fn run_validate(file: &Path) -> anyhow::Result<bool> {
    let doc = PolicyDocument::load(file)
        .await
        .with_context(|| format!("reading policy {}", file.display()))?;
    let snapshot = build_snapshot(&doc, &PluginRegistry::new());

    let mut names: Vec<_> = snapshot.filters.keys().collect();
    names.sort();
    let mut valid = true;
    for name in names {
        let info = &snapshot.filters[name];
        match &info.spec {
            Ok(_) => println!("ok     {name}: {}", info.description),
            Err(e) => {
                valid = false;
                println!("error  {name}: {e}");
            }
        }
    }
    // The callback rule is always present.
    println!("{} rule(s)", snapshot.rules.len() - 1);
    Ok(valid)
}

async fn run_server(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = cli.grpc_port {
        config.server.grpc_port = Some(port);
    }
    if let Some(policy) = cli.policy {
        config.policy.path = policy;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        http_port = config.server.http_port,
        grpc_port = ?config.server.grpc_port,
        policy = %config.policy.path.display(),
        "Starting authz-sidecar"
    );

    let server = Server::new(config, PluginRegistry::new())
        .await
        .context("initializing sidecar")?;
    server.run().await.context("serving")?;

    info!("authz-sidecar shutdown complete");
    Ok(())
}
