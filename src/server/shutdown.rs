//! Two-phase shutdown.
//!
//! The soft token stops listeners from accepting and lets in-flight checks
//! finish. If they are not done within the grace period the hard token
//! fires, and every task spawned through [`Shutdown::spawn_hijacked`] is
//! dropped where it stands.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Shutdown coordination shared by every listener.
#[derive(Clone, Default)]
pub struct Shutdown {
    soft: CancellationToken,
    hard: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled when listeners should stop accepting.
    pub fn soft(&self) -> &CancellationToken {
        &self.soft
    }

    /// Cancelled when remaining work must be abandoned.
    pub fn hard(&self) -> &CancellationToken {
        &self.hard
    }

    /// Run `task` until it completes or hard shutdown, whichever is first.
    pub fn spawn_hijacked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let hard = self.hard.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = task => {}
                () = hard.cancelled() => {}
            }
        });
    }

    /// Number of tracked tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Soft-cancel, wait up to `grace`, then hard-cancel and wait up to
    /// `timeout` overall.
    pub async fn drain(&self, grace: Duration, timeout: Duration) {
        self.soft.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            self.hard.cancel();
            info!("Shutdown complete");
            return;
        }

        warn!(
            remaining = self.tracker.len(),
            grace = ?grace,
            "Grace period over, aborting remaining work"
        );
        self.hard.cancel();
        let rest = timeout.saturating_sub(grace);
        if tokio::time::timeout(rest, self.tracker.wait()).await.is_err() {
            error!(remaining = self.tracker.len(), "Tasks still running at shutdown timeout");
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn finished_work_drains_within_grace() {
        let shutdown = Shutdown::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        shutdown.spawn_hijacked(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        shutdown.drain(Duration::from_secs(2), Duration::from_secs(3)).await;
        assert!(done.load(Ordering::SeqCst));
        assert!(shutdown.soft().is_cancelled());
        assert!(shutdown.hard().is_cancelled());
    }

    #[tokio::test]
    async fn stuck_work_is_aborted_after_grace() {
        // GIVEN a task that ignores the soft token
        let shutdown = Shutdown::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        shutdown.spawn_hijacked(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });

        // WHEN draining with a short grace
        let started = std::time::Instant::now();
        shutdown.drain(Duration::from_millis(50), Duration::from_secs(2)).await;

        // THEN the hard token ended it early
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(shutdown.in_flight(), 0);
    }
}
