#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use memoria::config::MemoriaConfig;
use memoria::embedding::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use memoria::expansion::{QueryExpander, QueryVariant};
use memoria::memory::types::{NewObservation, Observation, Scope};
use memoria::memory::Store;
use memoria::rerank::Reranker;
use memoria::service::{Backends, Service};
use memoria::vector::{VectorHit, VectorIndex};
use tempfile::TempDir;

/// Bag-of-words hashing embedder: texts sharing words land close together.
pub struct HashEmbedder;

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text.split_whitespace() {
            let h = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[h % EMBEDDING_DIM] += 1.0;
        }
        Ok(l2_normalize(&v))
    }
}

/// Scores documents by how often they mention `favourite`.
pub struct KeywordReranker {
    pub favourite: String,
}

impl Reranker for KeywordReranker {
    fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
        Ok(documents
            .iter()
            .map(|d| d.matches(self.favourite.as_str()).count() as f32 * 4.0 - 2.0)
            .collect())
    }
}

/// Blocks for `delay` before answering with one extra variant.
pub struct SlowExpander {
    pub delay: Duration,
}

impl QueryExpander for SlowExpander {
    fn expand(&self, query: &str) -> Result<Vec<QueryVariant>> {
        std::thread::sleep(self.delay);
        Ok(vec![
            QueryVariant::original(query),
            QueryVariant {
                text: format!("{query} slow"),
                weight: 0.5,
                source: "slow".into(),
                intent: None,
            },
        ])
    }
}

/// Errors on every query.
pub struct FailingExpander;

impl QueryExpander for FailingExpander {
    fn expand(&self, _query: &str) -> Result<Vec<QueryVariant>> {
        bail!("expansion model crashed")
    }
}

/// A vector index that is either disconnected or errors on every query.
pub struct BrokenVector {
    pub connected: bool,
}

impl VectorIndex for BrokenVector {
    fn is_connected(&self) -> bool {
        self.connected
    }
    fn query(&self, _text: &str, _limit: usize) -> Result<Vec<VectorHit>> {
        bail!("vector backend unreachable")
    }
    fn upsert(&self, _observation: &Observation) -> Result<()> {
        bail!("vector backend unreachable")
    }
    fn delete(&self, _id: &str) -> Result<()> {
        bail!("vector backend unreachable")
    }
    fn close(&self) {}
}

/// Returns fixed hits regardless of the query text.
pub struct FixedVector {
    pub hits: Vec<VectorHit>,
    pub closed: AtomicBool,
}

impl FixedVector {
    pub fn new(hits: Vec<(String, f64)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(id, score)| VectorHit { id, score })
                .collect(),
            closed: AtomicBool::new(false),
        }
    }
}

impl VectorIndex for FixedVector {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
    fn query(&self, _text: &str, limit: usize) -> Result<Vec<VectorHit>> {
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
    fn upsert(&self, _observation: &Observation) -> Result<()> {
        Ok(())
    }
    fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub fn new_observation(project: &str, title: &str, narrative: &str) -> NewObservation {
    NewObservation {
        project: project.into(),
        obs_type: "discovery".into(),
        title: title.into(),
        narrative: narrative.into(),
        ..Default::default()
    }
}

pub fn insert(store: &Store, project: &str, title: &str, narrative: &str) -> Observation {
    store
        .insert_observation(&new_observation(project, title, narrative))
        .unwrap()
}

pub fn insert_global(store: &Store, project: &str, title: &str) -> Observation {
    store
        .insert_observation(&NewObservation {
            scope: Some(Scope::Global),
            ..new_observation(project, title, "")
        })
        .unwrap()
}

/// Insert an observation that references `file` with a recorded mtime.
pub fn insert_with_file(store: &Store, project: &str, title: &str, file: &str, mtime: i64) -> Observation {
    store
        .insert_observation(&NewObservation {
            files: vec![file.to_string()],
            file_mtimes: BTreeMap::from([(file.to_string(), mtime)]),
            ..new_observation(project, title, "")
        })
        .unwrap()
}

/// Eight observations with no vocabulary in common.
pub const UNRELATED_TOPICS: [(&str, &str); 8] = [
    ("Database migration ordering", "schema versions apply sequentially"),
    ("Login cookie expiry", "sessions expire after thirty minutes"),
    ("Docker image size", "multistage build trims layers"),
    ("Flaky websocket test", "retry handshake when port busy"),
    ("Invoice rounding bug", "currency amounts use integer cents"),
    ("Tracing span names", "spans follow module paths"),
    ("Cache eviction policy", "least recently used entries dropped"),
    ("Keyboard shortcut conflict", "editor binding overrides terminal"),
];

/// Config pointing at a fresh database file inside `dir`.
pub fn config_in(dir: &TempDir) -> MemoriaConfig {
    let mut config = MemoriaConfig::default();
    config.storage.db_path = dir.path().join("data").join("memoria.db").display().to_string();
    config.embedding.cache_dir = dir.path().join("models").display().to_string();
    config.server.port = 0;
    config
}

pub fn hash_backends() -> Backends {
    Backends {
        embedder: Some(Arc::new(HashEmbedder)),
        ..Backends::default()
    }
}

/// A started service backed by a temp database and the hashing embedder.
pub fn started_service(dir: &TempDir) -> Arc<Service> {
    let service = Service::new(config_in(dir), hash_backends()).unwrap();
    service.start();
    service
}

/// Serve `service` on an ephemeral port. Returns the base URL.
pub async fn spawn_server(service: &Arc<Service>) -> String {
    let listener = memoria::server::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    memoria::server::spawn(service.clone(), listener);
    format!("http://{addr}")
}
