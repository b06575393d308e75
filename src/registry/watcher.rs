//! Reloads the registry when its file changes on disk.

use crate::error::Error;
use crate::registry::manager::RegistryManager;
use crate::Result;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events arriving within this window are folded into one reload.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Keeps the notify watcher and the reload task alive; both stop on drop.
pub struct RegistryWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl RegistryWatcher {
    /// Watches the directory holding the registry file.
    ///
    /// Atomic writes replace the file by rename, so the parent directory is
    /// watched and events are filtered by file name.
    pub fn spawn(manager: Arc<RegistryManager>) -> Result<Self> {
        let path = manager.store().path().to_path_buf();
        let file_name: OsString = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| Error::configuration("registry path has no file name"))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ".".into());

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watched = file_name.clone();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let touches_registry = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(watched.as_os_str()));
                if touches_registry {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Registry watcher error"),
        })
        .map_err(|e| Error::configuration(format!("failed to create registry watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                Error::configuration(format!("failed to watch {}: {e}", dir.display()))
            })?;

        tracing::info!(path = %path.display(), "Watching tool registry for changes");

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                match manager.reload().await {
                    Ok(version) => {
                        tracing::debug!(registry_version = version, "Registry watcher pass done")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Registry file changed but could not be reloaded; keeping current version")
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
