//! Stale-verification worker.
//!
//! A single consumer drains the bounded stale queue. Each request is checked
//! against an authoritative [`StalenessVerifier`]; invalid observations are
//! deleted, valid ones get their recorded file mtimes refreshed. Outcomes are
//! only logged and counted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::memory::types::Observation;
use crate::retrieval::staleness::{current_mtimes, resolve, StaleVerifyRequest};
use crate::service::Service;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Still accurate; carries the freshly observed mtimes.
    Valid(BTreeMap<String, i64>),
    Invalid(String),
}

/// Authoritative check of whether an observation still holds.
pub trait StalenessVerifier: Send + Sync {
    fn verify(&self, observation: &Observation, cwd: Option<&Path>) -> Result<Verdict>;
}

/// Invalid when any referenced file no longer exists.
#[derive(Debug, Default, Clone)]
pub struct FileSystemVerifier;

impl StalenessVerifier for FileSystemVerifier {
    fn verify(&self, observation: &Observation, cwd: Option<&Path>) -> Result<Verdict> {
        let paths: Vec<&String> = observation.file_mtimes.keys().collect();
        if let Some(missing) = paths.iter().find(|p| !resolve(p, cwd).exists()) {
            return Ok(Verdict::Invalid(format!("referenced file missing: {missing}")));
        }
        Ok(Verdict::Valid(current_mtimes(paths, cwd)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Refreshed,
    Deleted,
}

/// Consume requests until the service is cancelled or the queue closes.
pub async fn run(service: Arc<Service>, mut rx: mpsc::Receiver<StaleVerifyRequest>) {
    let token = service.token();
    tracing::info!("stale-verification worker started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => {
                    verify_one(&service, request).await;
                }
                None => break,
            },
        }
    }
    tracing::info!("stale-verification worker stopped");
}

/// Verify one request. Never fails; problems are logged.
pub async fn verify_one(service: &Service, request: StaleVerifyRequest) -> Outcome {
    if !service.is_ready() {
        return Outcome::Skipped;
    }
    let components = service.components();
    let verifier = service.verifier();
    let store = components.store.clone();
    let id = request.observation_id.clone();

    let task = tokio::task::spawn_blocking(move || -> Result<Option<(Observation, Verdict)>> {
        let Some(observation) = store.get_observation(&id)? else {
            return Ok(None);
        };
        let verdict = verifier.verify(&observation, request.cwd.as_deref())?;
        match &verdict {
            Verdict::Invalid(_) => {
                store.delete_observation(&observation.id)?;
            }
            Verdict::Valid(mtimes) => {
                store.refresh_file_mtimes(&observation.id, mtimes)?;
            }
        }
        Ok(Some((observation, verdict)))
    });

    let (observation, verdict) = match task.await {
        Ok(Ok(Some(found))) => found,
        Ok(Ok(None)) => return Outcome::Skipped,
        Ok(Err(e)) => {
            tracing::warn!(id = %request.observation_id, error = %e, "stale verification failed");
            return Outcome::Skipped;
        }
        Err(e) => {
            tracing::error!(id = %request.observation_id, error = %e, "stale verification panicked");
            return Outcome::Skipped;
        }
    };

    let stats = service.stats();
    stats.record_stale_verified(&observation.project);
    match verdict {
        Verdict::Invalid(reason) => {
            if let Some(vector) = &components.vector {
                if let Err(e) = vector.delete(&observation.id) {
                    tracing::warn!(id = %observation.id, error = %e, "vector delete failed");
                }
            }
            stats.record_deleted_invalid(&observation.project);
            tracing::info!(id = %observation.id, project = %observation.project, reason = %reason, "invalid observation deleted");
            Outcome::Deleted
        }
        Verdict::Valid(_) => {
            tracing::debug!(id = %observation.id, "observation still valid, mtimes refreshed");
            Outcome::Refreshed
        }
    }
}
