//! Policy document hot-reload
//!
//! Watches the policy file's directory, debounces bursts of events, and on
//! change rebuilds the snapshot and swaps it in. A document that fails to
//! parse leaves the running snapshot in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HttpClientConfig;
use crate::filters::PluginRegistry;
use crate::httpclient::HttpCache;
use crate::resources::PolicyDocument;
use crate::snapshot::{SnapshotStore, build_snapshot};
use crate::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Everything a reload touches.
#[derive(Clone)]
pub struct PolicySource {
    /// The YAML document
    pub path: PathBuf,
    /// Where snapshots are published
    pub snapshots: Arc<SnapshotStore>,
    /// Resized to fit the filter set
    pub cache: Arc<HttpCache>,
    /// Plugins filters may name
    pub plugins: Arc<PluginRegistry>,
    /// Cache sizing
    pub sizing: HttpClientConfig,
}

impl PolicySource {
    /// Read the document and publish a snapshot of it.
    ///
    /// Returns the number of filters. On error nothing is published.
    pub async fn reload(&self) -> Result<usize> {
        let doc = PolicyDocument::load(&self.path).await?;
        let snapshot = build_snapshot(&doc, &self.plugins);
        let count = snapshot.filters.len();
        self.snapshots.store(snapshot);
        self.cache.set_max_size(cache_size(&self.sizing, count));
        Ok(count)
    }
}

/// Cache capacity for `filters` filters.
pub fn cache_size(sizing: &HttpClientConfig, filters: usize) -> usize {
    sizing
        .default_cache_size
        .max(filters.saturating_mul(sizing.cache_size_per_filter))
}

/// Reloads the policy document whenever it changes on disk.
pub struct PolicyWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl PolicyWatcher {
    /// Start watching `source.path` until `shutdown` is cancelled.
    pub fn start(source: PolicySource, shutdown: CancellationToken) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = create_notify_watcher(event_tx, &source.path)?;
        spawn_reload_task(source, event_rx, shutdown);
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}

fn create_notify_watcher(
    event_tx: tokio::sync::mpsc::Sender<()>,
    policy_path: &Path,
) -> Result<RecommendedWatcher> {
    let watch_dir = match policy_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = policy_path.file_name().map(ToOwned::to_owned);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let relevant = result
                .as_ref()
                .is_ok_and(|e| is_policy_event(e, file_name.as_deref()));
            if relevant {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Internal(format!("Failed to create policy watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Internal(format!("Failed to watch {}: {e}", watch_dir.display())))?;

    Ok(watcher)
}

/// Create, modify or remove of the policy file itself. Matching on the file
/// name also catches the rename-into-place that ConfigMap updates do.
fn is_policy_event(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == file_name)
}

fn spawn_reload_task(
    source: PolicySource,
    mut event_rx: tokio::sync::mpsc::Receiver<()>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last_event: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        last_event = None;
                        reload_once(&source).await;
                    }
                }
                () = shutdown.cancelled() => {
                    debug!("Policy watcher shutting down");
                    break;
                }
            }
        }
    });
}

async fn reload_once(source: &PolicySource) {
    match source.reload().await {
        Ok(count) => info!(
            path = %source.path.display(),
            filters = count,
            cache_bytes = source.cache.max_size(),
            "Policy reloaded"
        ),
        Err(e) => warn!(
            path = %source.path.display(),
            error = %e,
            "Policy reload failed, keeping current policy"
        ),
    }
}
