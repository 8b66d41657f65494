//! Self-healing filesystem supervisor.
//!
//! Watches the directories holding the database and the config file. When the
//! database file is removed the service rebuilds its component set; when the
//! config file changes the daemon asks to exit so an outer process manager
//! restarts it with the new settings.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::service::{Service, StatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    DatabaseRemoved,
    SettingsChanged,
}

/// Running watcher. Dropping or stopping it ends the watch.
pub struct SupervisorHandle {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn stop(self) {
        self.task.abort();
        drop(self.watcher);
        tracing::info!("file watchers stopped");
    }
}

/// What the supervisor watches for.
#[derive(Debug, Clone)]
pub struct WatchTargets {
    pub db_file: Option<OsString>,
    pub config_file: Option<OsString>,
}

impl WatchTargets {
    pub fn new(db_path: &Path, config_path: Option<&Path>) -> Self {
        Self {
            db_file: db_path.file_name().map(OsString::from),
            config_file: config_path.and_then(|p| p.file_name()).map(OsString::from),
        }
    }

    /// Map a raw event to the action it calls for. Both targets are watched
    /// through their non-recursive parent directory, so matching on file name
    /// is enough.
    pub fn classify(&self, event: &Event) -> Option<WatchAction> {
        let names: Vec<&std::ffi::OsStr> =
            event.paths.iter().filter_map(|p| p.file_name()).collect();
        let touches = |target: &Option<OsString>| {
            target
                .as_deref()
                .is_some_and(|t| names.iter().any(|n| *n == t))
        };

        let removed = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        if removed && touches(&self.db_file) {
            return Some(WatchAction::DatabaseRemoved);
        }
        let changed = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        );
        if changed && touches(&self.config_file) {
            return Some(WatchAction::SettingsChanged);
        }
        None
    }
}

/// Rebuild rounds per detected removal. A round only repeats when the
/// database vanished again while the previous one was re-arming.
const HEAL_ROUNDS: usize = 3;

/// (Re-)register a non-recursive watch on each directory. A directory that
/// was deleted and recreated has a new inode, so any stale watch is dropped
/// first.
fn arm(watcher: &Mutex<RecommendedWatcher>, dirs: &[PathBuf]) -> Result<()> {
    let mut watcher = watcher
        .lock()
        .map_err(|_| anyhow::anyhow!("file watcher lock poisoned"))?;
    for dir in dirs {
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "not a directory, skipping watch");
            continue;
        }
        let _ = watcher.unwatch(dir);
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "watching");
    }
    Ok(())
}

/// Reinitialize after the database disappeared, then re-arm the watches on
/// the recreated directories.
async fn heal(service: &Service, watcher: &Mutex<RecommendedWatcher>, dirs: &[PathBuf]) {
    for _ in 0..HEAL_ROUNDS {
        match service.reinitialize().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "reinitialization failed");
                return;
            }
        }
        if let Err(e) = arm(watcher, dirs) {
            tracing::error!(error = %format!("{e:#}"), "re-arming file watchers failed");
        }
        if service.db_path().exists() {
            return;
        }
        tracing::warn!("database removed again during reinitialization");
    }
}

/// Start watching the service's database and config locations.
pub fn start(service: Arc<Service>) -> Result<SupervisorHandle> {
    let db_path = service.db_path().to_path_buf();
    let config_path = service.config().config_path().map(Path::to_path_buf);
    let targets = WatchTargets::new(&db_path, config_path.as_deref());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .context("failed to create file watcher")?;
    let watcher = Arc::new(Mutex::new(watcher));

    let mut dirs: Vec<PathBuf> = [Some(&db_path), config_path.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();
    dirs.dedup();
    arm(&watcher, &dirs)?;

    let token = service.token();
    let mut status = service.subscribe();
    let task_watcher = watcher.clone();
    let task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "watcher error");
                        continue;
                    }
                    None => break,
                },
                // Rebuilds started elsewhere also leave stale watches behind.
                Ok(StatusEvent::Reinitialized) = status.recv() => {
                    if let Err(e) = arm(&task_watcher, &dirs) {
                        tracing::error!(error = %format!("{e:#}"), "re-arming file watchers failed");
                    }
                    continue;
                }
            };
            match targets.classify(&event) {
                Some(WatchAction::DatabaseRemoved) => {
                    if service.db_path().exists() {
                        continue;
                    }
                    heal(&service, &task_watcher, &dirs).await;
                }
                Some(WatchAction::SettingsChanged) => {
                    tracing::warn!("settings changed, exiting for restart");
                    service.broadcast(StatusEvent::SettingsChanged);
                    service.request_exit();
                    break;
                }
                None => {}
            }
        }
    });

    Ok(SupervisorHandle { watcher, task })
}
