//! Retrieval counters: one set per project plus an aggregate.
//!
//! Counters only ever grow and live for the life of the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counters {
    requests: AtomicU64,
    served: AtomicU64,
    stale_verified: AtomicU64,
    deleted_invalid: AtomicU64,
    search_requests: AtomicU64,
    context_injections: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            stale_verified: self.stale_verified.load(Ordering::Relaxed),
            deleted_invalid: self.deleted_invalid.load(Ordering::Relaxed),
            search_requests: self.search_requests.load(Ordering::Relaxed),
            context_injections: self.context_injections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub requests: u64,
    pub served: u64,
    pub stale_verified: u64,
    pub deleted_invalid: u64,
    pub search_requests: u64,
    pub context_injections: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub aggregate: CounterSnapshot,
    pub projects: BTreeMap<String, CounterSnapshot>,
}

#[derive(Debug, Default)]
pub struct RetrievalStats {
    aggregate: Counters,
    projects: RwLock<HashMap<String, Arc<Counters>>>,
}

impl RetrievalStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn project(&self, project: &str) -> Arc<Counters> {
        if let Ok(map) = self.projects.read() {
            if let Some(counters) = map.get(project) {
                return counters.clone();
            }
        }
        match self.projects.write() {
            Ok(mut map) => map.entry(project.to_string()).or_default().clone(),
            // A poisoned map still counts toward the aggregate.
            Err(_) => Arc::new(Counters::default()),
        }
    }

    fn bump(&self, project: &str, field: impl Fn(&Counters) -> &AtomicU64, by: u64) {
        field(&self.aggregate).fetch_add(by, Ordering::Relaxed);
        field(&self.project(project)).fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_search(&self, project: &str, served: usize) {
        self.bump(project, |c| &c.requests, 1);
        self.bump(project, |c| &c.search_requests, 1);
        self.bump(project, |c| &c.served, served as u64);
    }

    pub fn record_injection(&self, project: &str, served: usize) {
        self.bump(project, |c| &c.requests, 1);
        self.bump(project, |c| &c.context_injections, 1);
        self.bump(project, |c| &c.served, served as u64);
    }

    pub fn record_stale_verified(&self, project: &str) {
        self.bump(project, |c| &c.stale_verified, 1);
    }

    pub fn record_deleted_invalid(&self, project: &str) {
        self.bump(project, |c| &c.deleted_invalid, 1);
    }

    pub fn aggregate(&self) -> CounterSnapshot {
        self.aggregate.snapshot()
    }

    pub fn for_project(&self, project: &str) -> CounterSnapshot {
        self.projects
            .read()
            .ok()
            .and_then(|map| map.get(project).map(|c| c.snapshot()))
            .unwrap_or_default()
    }

    pub fn report(&self) -> StatsReport {
        let projects = self
            .projects
            .read()
            .map(|map| {
                map.iter()
                    .map(|(name, counters)| (name.clone(), counters.snapshot()))
                    .collect()
            })
            .unwrap_or_default();
        StatsReport {
            aggregate: self.aggregate(),
            projects,
        }
    }
}
