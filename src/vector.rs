//! Vector similarity index.
//!
//! The retrieval pipeline only sees the [`VectorIndex`] trait: query text in,
//! `(observation id, similarity)` pairs out. [`SqliteVecIndex`] keeps one
//! 384-dim vector per observation in the `observations_vec` vec0 table of the
//! store's database and encodes text through an [`EmbeddingProvider`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use rusqlite::params;

use crate::embedding::EmbeddingProvider;
use crate::memory::types::Observation;
use crate::memory::{embedding_to_bytes, l2_to_cosine, Store};

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in `[-1, 1]`, higher is closer.
    pub score: f64,
}

/// A similarity index over observations. Synchronous; call from
/// `spawn_blocking` in async code.
pub trait VectorIndex: Send + Sync {
    /// Whether the index can currently serve queries.
    fn is_connected(&self) -> bool;

    /// Nearest observations to `text`, best first, at most `limit`.
    fn query(&self, text: &str, limit: usize) -> Result<Vec<VectorHit>>;

    /// Index (or re-index) an observation.
    fn upsert(&self, observation: &Observation) -> Result<()>;

    /// Remove an observation from the index. Missing ids are not an error.
    fn delete(&self, id: &str) -> Result<()>;

    /// Disconnect. Later queries fail.
    fn close(&self);
}

/// Text indexed for an observation: title, narrative and facts.
pub fn index_text(observation: &Observation) -> String {
    let mut text = format!("{}\n{}", observation.title, observation.narrative);
    for fact in &observation.facts {
        text.push('\n');
        text.push_str(fact);
    }
    text
}

pub struct SqliteVecIndex {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    connected: AtomicBool,
}

impl SqliteVecIndex {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            embedder,
            connected: AtomicBool::new(true),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            bail!("vector index is disconnected");
        }
        Ok(())
    }
}

impl VectorIndex for SqliteVecIndex {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.store.is_closed()
    }

    fn query(&self, text: &str, limit: usize) -> Result<Vec<VectorHit>> {
        self.ensure_connected()?;
        if limit == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(text)?;
        let bytes = embedding_to_bytes(&embedding);

        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, distance FROM observations_vec \
                 WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            )?;
            let hits = stmt
                .query_map(params![bytes, limit as i64], |row| {
                    let distance: f64 = row.get(1)?;
                    Ok(VectorHit {
                        id: row.get(0)?,
                        score: l2_to_cosine(distance),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(hits)
        })
    }

    fn upsert(&self, observation: &Observation) -> Result<()> {
        self.ensure_connected()?;
        let embedding = self.embedder.embed(&index_text(observation))?;
        let bytes = embedding_to_bytes(&embedding);
        self.store.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM observations_vec WHERE id = ?1",
                params![observation.id],
            )?;
            tx.execute(
                "INSERT INTO observations_vec (id, embedding) VALUES (?1, ?2)",
                params![observation.id, bytes],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.ensure_connected()?;
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM observations_vec WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!("vector index disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{l2_normalize, EMBEDDING_DIM};
    use crate::memory::types::NewObservation;

    /// Bag-of-words hashing embedder: texts sharing words land close together.
    struct HashEmbedder;

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

    fn setup() -> (Arc<Store>, SqliteVecIndex) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let index = SqliteVecIndex::new(store.clone(), Arc::new(HashEmbedder));
        (store, index)
    }

    fn add(store: &Store, index: &SqliteVecIndex, title: &str) -> Observation {
        let obs = store
            .insert_observation(&NewObservation {
                project: "demo".into(),
                obs_type: "change".into(),
                title: title.into(),
                ..Default::default()
            })
            .unwrap();
        index.upsert(&obs).unwrap();
        obs
    }

    #[test]
    fn query_returns_closest_first() {
        let (store, index) = setup();
        let rust = add(&store, &index, "rust borrow checker lifetimes");
        let _py = add(&store, &index, "python asyncio event loop");

        let hits = index.query("borrow checker", 5).unwrap();
        assert_eq!(hits[0].id, rust.id);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let (store, index) = setup();
        let obs = add(&store, &index, "database migrations");
        index.upsert(&obs).unwrap();
        assert_eq!(index.query("database", 10).unwrap().len(), 1);

        index.delete(&obs.id).unwrap();
        assert!(index.query("database", 10).unwrap().is_empty());
    }

    #[test]
    fn closed_index_refuses_queries() {
        let (_store, index) = setup();
        index.close();
        assert!(!index.is_connected());
        assert!(index.query("anything", 5).is_err());
    }

    #[test]
    fn identical_text_scores_near_one() {
        let (store, index) = setup();
        add(&store, &index, "exact phrase match");
        let hits = index.query("exact phrase match", 1).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-3);
    }
}
