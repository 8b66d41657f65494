//! Hybrid retrieval: search-by-prompt and context injection.
//!
//! Search runs expansion, vector candidates, full-text and recency fallbacks,
//! the staleness filter, optional reranking, near-duplicate clustering,
//! ordering/capping and bookkeeping. Injection skips the query-dependent
//! stages and serves the most recent observations of a project.
//!
//! Every optional stage degrades to the next fallback on failure. Only the
//! final recency lookup can fail a request.

pub mod cluster;
pub mod recent;
pub mod staleness;
pub mod stats;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MemoriaConfig;
use crate::error::ApiError;
use crate::expansion::{QueryExpander, QueryVariant};
use crate::memory::types::Observation;
use crate::memory::Store;
use crate::rerank::{self, RerankCandidate, RerankMode, Reranker};
use crate::vector::VectorIndex;

use recent::RecentQueries;
use staleness::StaleQueue;
use stats::RetrievalStats;

/// Discount applied to the configured threshold for vector candidates.
pub const THRESHOLD_DISCOUNT: f64 = 0.9;
/// Request limit when the caller gives none.
pub const DEFAULT_LIMIT: usize = 50;
/// Upper bound on any requested limit.
pub const MAX_LIMIT: usize = 500;
/// Budget for the fire-and-forget retrieval-count update.
pub const INCREMENT_TIMEOUT: Duration = Duration::from_secs(5);

static PROJECT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid project regex")
});

/// Check a project name is non-empty and traversal-safe.
pub fn validate_project(project: &str) -> Result<(), ApiError> {
    if project.is_empty() {
        return Err(ApiError::BadRequest("project is required".into()));
    }
    if !PROJECT_NAME.is_match(project) || project.contains("..") {
        return Err(ApiError::BadRequest(format!("invalid project name: {project}")));
    }
    Ok(())
}

/// Working directories must be absolute when given.
pub fn validate_cwd(cwd: Option<&str>) -> Result<Option<PathBuf>, ApiError> {
    match cwd.map(str::trim).filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(c) if c.contains('\0') => Err(ApiError::BadRequest("invalid cwd".into())),
        Some(c) if !Path::new(c).is_absolute() => {
            Err(ApiError::BadRequest(format!("cwd must be absolute: {c}")))
        }
        Some(c) => Ok(Some(PathBuf::from(c))),
    }
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_LIMIT)
}

/// Retrieval knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub relevance_threshold: f64,
    pub max_prompt_results: usize,
    pub context_observations: usize,
    pub context_full_count: usize,
    pub cluster_threshold: f64,
    pub rerank_enabled: bool,
    pub rerank_mode: RerankMode,
    pub rerank_top_k: usize,
    pub expansion_enabled: bool,
    pub expansion_timeout: Duration,
}

impl RetrievalSettings {
    pub fn from_config(config: &MemoriaConfig) -> Self {
        Self {
            relevance_threshold: config.retrieval.relevance_threshold,
            max_prompt_results: config.retrieval.max_prompt_results,
            context_observations: config.retrieval.context_observations,
            context_full_count: config.retrieval.context_full_count,
            cluster_threshold: config.retrieval.cluster_threshold,
            rerank_enabled: config.rerank.enabled,
            rerank_mode: RerankMode::from_pure(config.rerank.pure),
            rerank_top_k: config.rerank.top_k,
            expansion_enabled: config.expansion.enabled,
            expansion_timeout: Duration::from_millis(config.expansion.timeout_ms),
        }
    }

    pub fn effective_threshold(&self) -> f64 {
        self.relevance_threshold * THRESHOLD_DISCOUNT
    }

    /// Final result count for a request limit. A zero `max_prompt_results`
    /// leaves the request limit as the only bound.
    pub fn result_cap(&self, limit: usize) -> usize {
        match self.max_prompt_results {
            0 => limit,
            max => limit.min(max),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from_config(&MemoriaConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub project: String,
    pub query: String,
    pub cwd: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct InjectRequest {
    pub project: String,
    pub cwd: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub observations: Vec<Observation>,
    pub threshold: f64,
    pub expansions: Vec<QueryVariant>,
    pub used_vector: bool,
    pub reranked: bool,
    pub stale_excluded: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectResponse {
    pub observations: Vec<Observation>,
    pub full_count: usize,
    pub stale_excluded: usize,
    pub duplicates_removed: usize,
}

/// Everything one retrieval request reads or writes back to.
#[derive(Clone)]
pub struct Retriever {
    pub store: Arc<Store>,
    pub vector: Option<Arc<dyn VectorIndex>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub expander: Option<Arc<dyn QueryExpander>>,
    pub settings: RetrievalSettings,
    pub stats: Arc<RetrievalStats>,
    pub recent: Arc<RecentQueries>,
    pub stale_queue: StaleQueue,
    pub tracker: TaskTracker,
    pub token: CancellationToken,
}

/// Outcome of the vector stage.
enum VectorStage {
    Unavailable,
    Failed,
    Hits(Vec<Observation>),
}

impl Retriever {
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, ApiError> {
        let project = request.project.trim().to_string();
        validate_project(&project)?;
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(ApiError::BadRequest("query is required".into()));
        }
        let cwd = validate_cwd(request.cwd.as_deref())?;
        let limit = clamp_limit(request.limit, DEFAULT_LIMIT);

        let variants = self.expand(&query).await;

        let mut used_vector = false;
        let mut candidates = match self.vector_candidates(&project, &variants, limit).await {
            VectorStage::Hits(hits) if !hits.is_empty() => {
                used_vector = true;
                hits
            }
            VectorStage::Hits(_) | VectorStage::Unavailable | VectorStage::Failed => Vec::new(),
        };
        if !used_vector {
            candidates = self.fulltext_or_recent(&project, &query, limit).await?;
        }

        let (candidates, stale_excluded) = self.filter_stale(candidates, cwd).await;

        let mut reranked = false;
        let candidates = if used_vector {
            match self.rerank(&query, &candidates).await {
                Some(ordered) => {
                    reranked = true;
                    ordered
                }
                None => candidates,
            }
        } else {
            candidates
        };

        let (mut observations, duplicates_removed) =
            cluster::cluster(candidates, self.settings.cluster_threshold);

        if !reranked && observations.iter().any(|o| o.score.is_some()) {
            observations.sort_by(|a, b| {
                b.score
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&a.score.unwrap_or(f64::NEG_INFINITY))
            });
        }
        observations.truncate(self.settings.result_cap(limit));

        self.stats.record_search(&project, observations.len());
        self.spawn_retrieval_increment(&observations);
        self.recent
            .record(&query, &project, observations.len(), used_vector);

        tracing::info!(
            project = %project,
            results = observations.len(),
            used_vector,
            reranked,
            stale_excluded,
            duplicates_removed,
            "search served"
        );

        Ok(SearchResponse {
            observations,
            threshold: self.settings.relevance_threshold,
            expansions: variants,
            used_vector,
            reranked,
            stale_excluded,
            duplicates_removed,
        })
    }

    pub async fn inject(&self, request: InjectRequest) -> Result<InjectResponse, ApiError> {
        let project = request.project.trim().to_string();
        validate_project(&project)?;
        let cwd = validate_cwd(request.cwd.as_deref())?;
        let limit = clamp_limit(request.limit, self.settings.context_observations);

        let store = self.store.clone();
        let lookup_project = project.clone();
        let recent =
            tokio::task::spawn_blocking(move || store.recent_observations(&lookup_project, limit))
                .await??;

        let (candidates, stale_excluded) = self.filter_stale(recent, cwd).await;
        let (observations, duplicates_removed) =
            cluster::cluster(candidates, self.settings.cluster_threshold);

        self.stats.record_injection(&project, observations.len());
        self.spawn_retrieval_increment(&observations);
        self.recent.record("", &project, observations.len(), false);

        tracing::info!(
            project = %project,
            results = observations.len(),
            stale_excluded,
            duplicates_removed,
            "context injected"
        );

        Ok(InjectResponse {
            observations,
            full_count: self.settings.context_full_count,
            stale_excluded,
            duplicates_removed,
        })
    }

    /// Expanded variants, or just the original on timeout, absence or error.
    async fn expand(&self, query: &str) -> Vec<QueryVariant> {
        let fallback = || vec![QueryVariant::original(query)];
        let expander = match (&self.expander, self.settings.expansion_enabled) {
            (Some(e), true) => e.clone(),
            _ => return fallback(),
        };

        let text = query.to_string();
        let task = tokio::task::spawn_blocking(move || expander.expand(&text));
        match tokio::time::timeout(self.settings.expansion_timeout, task).await {
            Ok(Ok(Ok(variants))) if !variants.is_empty() => variants,
            Ok(Ok(Ok(_))) => fallback(),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "query expansion failed");
                fallback()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query expansion task panicked");
                fallback()
            }
            Err(_) => {
                tracing::warn!("query expansion timed out");
                fallback()
            }
        }
    }

    async fn vector_candidates(
        &self,
        project: &str,
        variants: &[QueryVariant],
        limit: usize,
    ) -> VectorStage {
        let vector = match &self.vector {
            Some(v) if v.is_connected() => v.clone(),
            _ => return VectorStage::Unavailable,
        };
        let store = self.store.clone();
        let variants = variants.to_vec();
        let project = project.to_string();
        let threshold = self.settings.effective_threshold();

        let task = tokio::task::spawn_blocking(move || {
            let mut weighted: Vec<(String, f64)> = Vec::new();
            let mut failures = 0;
            for variant in &variants {
                match vector.query(&variant.text, limit * 2) {
                    Ok(hits) => weighted.extend(
                        hits.into_iter()
                            .map(|h| (h.id, h.score * variant.weight)),
                    ),
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(variant = %variant.text, error = %e, "vector query failed");
                    }
                }
            }
            if failures == variants.len() {
                return Ok(VectorStage::Failed);
            }

            let mut best: HashMap<String, f64> = HashMap::new();
            for (id, score) in weighted.into_iter().filter(|(_, s)| *s >= threshold) {
                let entry = best.entry(id).or_insert(score);
                if score > *entry {
                    *entry = score;
                }
            }
            if best.is_empty() {
                return Ok(VectorStage::Hits(Vec::new()));
            }

            let ids: Vec<String> = best.keys().cloned().collect();
            let observations = store
                .get_observations_by_ids(&ids, ids.len())?
                .into_iter()
                .filter(|o| o.visible_to(&project))
                .take(limit)
                .map(|mut o| {
                    o.score = best.get(&o.id).copied();
                    o
                })
                .collect();
            anyhow::Ok(VectorStage::Hits(observations))
        });

        match task.await {
            Ok(Ok(stage)) => stage,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "vector candidate fetch failed");
                VectorStage::Failed
            }
            Err(e) => {
                tracing::warn!(error = %e, "vector stage panicked");
                VectorStage::Failed
            }
        }
    }

    /// Full-text search, falling back to plain recency if it errors.
    async fn fulltext_or_recent(
        &self,
        project: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, ApiError> {
        let store = self.store.clone();
        let project = project.to_string();
        let query = query.to_string();
        let observations = tokio::task::spawn_blocking(move || {
            match store.search_fts(&project, &query, limit) {
                Ok(found) => Ok(found),
                Err(e) => {
                    tracing::warn!(error = %e, "full-text search failed, using recency");
                    store.recent_observations(&project, limit)
                }
            }
        })
        .await??;
        Ok(observations)
    }

    async fn filter_stale(
        &self,
        candidates: Vec<Observation>,
        cwd: Option<PathBuf>,
    ) -> (Vec<Observation>, usize) {
        let queue = self.stale_queue.clone();
        let count = candidates.len();
        let task = tokio::task::spawn_blocking(move || {
            staleness::filter_stale(candidates, cwd.as_deref(), &queue)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, count, "staleness filter panicked");
                (Vec::new(), 0)
            }
        }
    }

    /// Reordered candidates with overwritten scores, or `None` to keep the
    /// original order.
    async fn rerank(&self, query: &str, candidates: &[Observation]) -> Option<Vec<Observation>> {
        if !self.settings.rerank_enabled || candidates.is_empty() {
            return None;
        }
        let reranker = self.reranker.clone()?;
        let inputs: Vec<RerankCandidate> = candidates
            .iter()
            .map(|o| RerankCandidate {
                id: o.id.clone(),
                score: o.score.unwrap_or(0.0),
                text: o.rerank_text(),
            })
            .collect();
        let query = query.to_string();
        let mode = self.settings.rerank_mode;
        let top_k = self.settings.rerank_top_k;

        let task = tokio::task::spawn_blocking(move || {
            rerank::rerank(reranker.as_ref(), &query, &inputs, mode, top_k)
        });
        let ranked = match task.await {
            Ok(Ok(ranked)) => ranked,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "rerank failed, keeping original order");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank task panicked");
                return None;
            }
        };

        let mut by_id: HashMap<&str, &Observation> =
            candidates.iter().map(|o| (o.id.as_str(), o)).collect();
        Some(
            ranked
                .into_iter()
                .filter_map(|r| {
                    by_id.remove(r.id.as_str()).map(|o| {
                        let mut o = o.clone();
                        o.score = Some(r.score);
                        o
                    })
                })
                .collect(),
        )
    }

    /// Bump retrieval counters in the background, bounded by the service
    /// lifecycle and [`INCREMENT_TIMEOUT`].
    fn spawn_retrieval_increment(&self, observations: &[Observation]) {
        if observations.is_empty() {
            return;
        }
        let ids: Vec<String> = observations.iter().map(|o| o.id.clone()).collect();
        let store = self.store.clone();
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let work = tokio::task::spawn_blocking(move || store.increment_retrieval_counts(&ids));
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("retrieval count update cancelled");
                }
                result = tokio::time::timeout(INCREMENT_TIMEOUT, work) => match result {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => tracing::warn!(error = %e, "retrieval count update failed"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "retrieval count task panicked"),
                    Err(_) => tracing::warn!("retrieval count update timed out"),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names() {
        assert!(validate_project("demo").is_ok());
        assert!(validate_project("my-app.v2_x").is_ok());
        assert!(validate_project("").is_err());
        assert!(validate_project("../etc").is_err());
        assert!(validate_project("a..b").is_err());
        assert!(validate_project("a/b").is_err());
        assert!(validate_project(".hidden").is_err());
        assert!(validate_project(&"x".repeat(129)).is_err());
    }

    #[test]
    fn cwd_must_be_absolute() {
        assert_eq!(validate_cwd(None).unwrap(), None);
        assert_eq!(validate_cwd(Some("  ")).unwrap(), None);
        assert_eq!(
            validate_cwd(Some("/work/repo")).unwrap(),
            Some(PathBuf::from("/work/repo"))
        );
        assert!(validate_cwd(Some("relative/dir")).is_err());
    }

    #[test]
    fn limits_clamp() {
        assert_eq!(clamp_limit(None, 50), 50);
        assert_eq!(clamp_limit(Some(0), 50), 1);
        assert_eq!(clamp_limit(Some(10_000), 50), MAX_LIMIT);
    }

    #[test]
    fn result_cap_is_the_smaller_bound() {
        let mut settings = RetrievalSettings::default();
        assert_eq!(settings.result_cap(DEFAULT_LIMIT), 50);
        assert_eq!(settings.result_cap(100), 50);
        assert_eq!(settings.result_cap(3), 3);
        settings.max_prompt_results = 0;
        assert_eq!(settings.result_cap(100), 100);
    }

    #[test]
    fn effective_threshold_is_discounted() {
        let settings = RetrievalSettings::default();
        assert!((settings.effective_threshold() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn expansion_budget_defaults_to_five_seconds() {
        assert_eq!(
            RetrievalSettings::default().expansion_timeout,
            Duration::from_secs(5)
        );
    }
}
