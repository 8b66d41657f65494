//! Freshness checks against the files an observation references.
//!
//! An observation is stale when any referenced file's modification time no
//! longer matches what was recorded (a missing file counts as a mismatch).
//! Stale candidates are dropped from the response and handed to the
//! verification worker through a bounded, non-blocking queue; nothing is
//! verified inline.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::sync::mpsc;

use crate::memory::types::Observation;

/// Capacity of the stale-verification queue.
pub const STALE_QUEUE_CAPACITY: usize = 100;

/// A request to re-verify one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleVerifyRequest {
    pub observation_id: String,
    pub cwd: Option<PathBuf>,
}

/// Producer side of the stale-verification queue.
#[derive(Debug, Clone)]
pub struct StaleQueue {
    tx: mpsc::Sender<StaleVerifyRequest>,
}

impl StaleQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StaleVerifyRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. Returns `false` if the request was dropped
    /// because the queue is full or the worker is gone.
    pub fn offer(&self, request: StaleVerifyRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::debug!(id = %req.observation_id, "stale queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Resolve a recorded path against the working directory.
pub fn resolve(path: &str, cwd: Option<&Path>) -> PathBuf {
    let p = Path::new(path);
    match cwd {
        Some(dir) if p.is_relative() => dir.join(p),
        _ => p.to_path_buf(),
    }
}

/// Modification time of `path` in ms since the epoch, `None` if unreadable.
pub fn file_mtime(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    i64::try_from(millis).ok()
}

/// Current mtimes of the files that exist, keyed by the path as given.
pub fn current_mtimes<'a>(
    files: impl IntoIterator<Item = &'a String>,
    cwd: Option<&Path>,
) -> BTreeMap<String, i64> {
    files
        .into_iter()
        .filter_map(|f| file_mtime(&resolve(f, cwd)).map(|m| (f.clone(), m)))
        .collect()
}

/// Whether any recorded mtime differs from the file's current one.
pub fn is_stale(observation: &Observation, cwd: Option<&Path>) -> bool {
    observation
        .file_mtimes
        .iter()
        .any(|(path, recorded)| file_mtime(&resolve(path, cwd)) != Some(*recorded))
}

/// Drop stale observations, enqueueing each once for verification.
/// Returns the fresh observations and how many were excluded.
pub fn filter_stale(
    observations: Vec<Observation>,
    cwd: Option<&Path>,
    queue: &StaleQueue,
) -> (Vec<Observation>, usize) {
    let mut fresh = Vec::with_capacity(observations.len());
    let mut enqueued = HashSet::new();
    let mut excluded = 0;

    for observation in observations {
        if observation.file_mtimes.is_empty() || !is_stale(&observation, cwd) {
            fresh.push(observation);
            continue;
        }
        excluded += 1;
        if enqueued.insert(observation.id.clone()) {
            queue.offer(StaleVerifyRequest {
                observation_id: observation.id,
                cwd: cwd.map(Path::to_path_buf),
            });
        }
    }

    if excluded > 0 {
        tracing::debug!(excluded, "stale observations excluded");
    }
    (fresh, excluded)
}
