//! Sidecar server
//!
//! Wires the shared services together (keypair, HTTP cache, snapshot
//! store, evaluator), loads the policy once, and serves the HTTP and gRPC
//! check endpoints until a shutdown signal.

pub mod grpc;
pub mod http;
pub mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use self::grpc::AuthorizationService;
use self::http::{HttpState, router};
use self::shutdown::Shutdown;
use crate::config::Config;
use crate::evaluator::FilterMux;
use crate::filters::{FilterDeps, PluginRegistry};
use crate::httpclient::{HttpCache, HttpClientFactory};
use crate::keypair::load_or_create_in_dir;
use crate::snapshot::SnapshotStore;
use crate::watcher::{PolicySource, PolicyWatcher};
use crate::{Error, Result};

/// A configured, not yet listening, sidecar.
pub struct Server {
    config: Config,
    mux: FilterMux,
    source: PolicySource,
}

impl Server {
    /// Load the keypair and the policy, and build the evaluator.
    ///
    /// A policy file that cannot be read leaves the sidecar running with no
    /// rules (everything allowed) until a reload succeeds.
    pub async fn new(config: Config, plugins: PluginRegistry) -> Result<Self> {
        let keypair = load_or_create_in_dir(&config.keys.directory, &config.keys.name, config.keys.bits).await?;
        info!(name = %config.keys.name, directory = %config.keys.directory.display(), "Session keypair ready");

        let cache = Arc::new(HttpCache::new(config.http_client.default_cache_size));
        let http = Arc::new(HttpClientFactory::new(Arc::clone(&cache), config.http_client.timeout)?);
        let snapshots = Arc::new(SnapshotStore::default());

        let source = PolicySource {
            path: config.policy.path.clone(),
            snapshots: Arc::clone(&snapshots),
            cache,
            plugins: Arc::new(plugins),
            sizing: config.http_client.clone(),
        };
        match source.reload().await {
            Ok(count) => info!(path = %source.path.display(), filters = count, "Policy loaded"),
            Err(e) => warn!(path = %source.path.display(), error = %e, "Policy not loaded, starting with no rules"),
        }

        let deps = FilterDeps {
            http,
            keypair: Arc::new(keypair),
        };
        Ok(Self {
            config,
            mux: FilterMux::new(snapshots, deps),
            source,
        })
    }

    /// The evaluator both endpoints share.
    pub fn mux(&self) -> &FilterMux {
        &self.mux
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        let ip = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host {:?}: {e}", self.config.server.host)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Serve until Ctrl+C or SIGTERM, then drain.
    pub async fn run(self) -> Result<()> {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            shutdown::signal().await;
            trigger.soft().cancel();
        });
        self.run_until(shutdown).await
    }

    /// Serve until `shutdown`'s soft token is cancelled, then drain.
    pub async fn run_until(self, shutdown: Shutdown) -> Result<()> {
        let server = &self.config.server;

        let _watcher = if self.config.policy.watch {
            match PolicyWatcher::start(self.source.clone(), shutdown.soft().clone()) {
                Ok(w) => {
                    info!(path = %self.source.path.display(), "Policy hot-reload enabled");
                    Some(w)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start policy watcher, hot-reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let http_addr = self.addr(server.http_port)?;
        let listener = TcpListener::bind(http_addr).await?;
        let app = router(
            HttpState {
                mux: self.mux.clone(),
                request_timeout: server.request_timeout,
                draining: shutdown.soft().clone(),
            },
            server.max_body_size,
        );
        let soft = shutdown.soft().clone();
        shutdown.spawn_hijacked(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(soft.cancelled_owned())
                .await
            {
                warn!(error = %e, "HTTP server error");
            }
        });
        info!(addr = %http_addr, "HTTP ext_authz listening");

        if let Some(port) = server.grpc_port {
            let grpc_addr = self.addr(port)?;
            let listener = TcpListener::bind(grpc_addr).await?;
            let service = AuthorizationService::new(self.mux.clone(), server.request_timeout);
            let soft = shutdown.soft().clone();
            shutdown.spawn_hijacked(async move {
                if let Err(e) = tonic::transport::Server::builder()
                    .add_service(service.into_server())
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::TcpListenerStream::new(listener),
                        soft.cancelled_owned(),
                    )
                    .await
                {
                    warn!(error = %e, "gRPC server error");
                }
            });
            info!(addr = %grpc_addr, "gRPC ext_authz v3 listening");
        }

        info!(version = env!("CARGO_PKG_VERSION"), "authz-sidecar ready");

        shutdown.soft().cancelled().await;
        info!(grace = ?server.shutdown_grace, "Draining");
        shutdown
            .drain(server.shutdown_grace, server.shutdown_timeout)
            .await;
        Ok(())
    }
}
