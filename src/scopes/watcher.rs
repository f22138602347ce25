//! Hot reload of the scopes file.
//!
//! A `notify` watcher on the file's directory feeds a debounced tokio task;
//! once events stop arriving for [`DEBOUNCE`] the file is re-read and swapped
//! into the engine. A file that fails to parse or validate is logged and the
//! current mapping stays active.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ScopePolicyEngine;
use crate::{Error, Result};

/// Quiet period before a burst of file events triggers a reload
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the file watcher alive; dropping it stops watching.
pub struct ScopeWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ScopeWatcher {
    /// Watch the engine's backing file and reload it on change.
    ///
    /// # Errors
    ///
    /// Fails when the engine has no backing file or the watcher cannot be
    /// installed.
    pub fn start(
        engine: Arc<ScopePolicyEngine>,
        shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let path = engine
            .source()
            .ok_or_else(|| Error::Configuration("scopes.watch requires scopes.path".into()))?
            .to_path_buf();
        let watched = watched_paths(&path);

        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<()>(16);
        let watcher = create_notify_watcher(event_tx, &path, watched)?;
        spawn_reload_task(engine, event_rx, shutdown);

        info!(path = %path.display(), "Watching scopes file for changes");
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}

/// The configured path plus its canonical form; some platforms report
/// events under the resolved path.
fn watched_paths(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    if let (Some(dir), Some(name)) = (path.parent(), path.file_name()) {
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
        if let Ok(canonical) = dir.canonicalize() {
            paths.push(canonical.join(name));
        }
    }
    paths
}

fn create_notify_watcher(
    event_tx: tokio::sync::mpsc::Sender<()>,
    path: &Path,
    watched: Vec<PathBuf>,
) -> Result<RecommendedWatcher> {
    let watch_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if result.as_ref().is_ok_and(|e| is_scopes_event(e, &watched)) {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Internal(format!("Failed to create scopes watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Internal(format!("Failed to watch scopes path: {e}")))?;

    Ok(watcher)
}

fn spawn_reload_task(
    engine: Arc<ScopePolicyEngine>,
    mut event_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
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
                        reload_once(&engine);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Scopes watcher shutting down");
                    break;
                }
            }
        }
    });
}

/// Create/modify events on the scopes file.
fn is_scopes_event(event: &Event, watched: &[PathBuf]) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| watched.iter().any(|w| w == p))
}

fn reload_once(engine: &ScopePolicyEngine) {
    match engine.reload_from_source() {
        Ok(mapping) => info!(
            groups = mapping.groups.len(),
            aliases = mapping.group_mappings.len(),
            "Scopes file reloaded"
        ),
        Err(e) => warn!(error = %e, "Scopes reload failed, keeping current mapping"),
    }
}
