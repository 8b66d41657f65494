//! Second-stage relevance scoring with a cross-encoder.
//!
//! A [`Reranker`] returns one raw logit per `(query, document)` pair. [`rerank`]
//! turns those into final scores, either from the cross-encoder alone
//! ([`RerankMode::Pure`]) or blended with the first-stage score
//! ([`RerankMode::Combined`]).

use std::path::Path;

use anyhow::Result;

use crate::onnx::OnnxModel;

/// Weight of the normalised first-stage score in combined mode.
const ORIGINAL_WEIGHT: f64 = 0.3;
/// Weight of the cross-encoder probability in combined mode.
const CROSS_ENCODER_WEIGHT: f64 = 0.7;

const MAX_SEQ_LEN: usize = 512;

/// Scores query/document pairs. Synchronous; call from `spawn_blocking`.
pub trait Reranker: Send + Sync {
    /// Raw relevance logits, one per document, in input order.
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankMode {
    Pure,
    Combined,
}

impl RerankMode {
    pub fn from_pure(pure: bool) -> Self {
        if pure {
            Self::Pure
        } else {
            Self::Combined
        }
    }
}

/// A first-stage candidate handed to the reranker.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub score: f64,
    pub text: String,
}

/// A reranked result with its overwritten score.
#[derive(Debug, Clone, PartialEq)]
pub struct Reranked {
    pub id: String,
    pub score: f64,
}

/// Rerank `candidates` against `query`, best first.
///
/// `top_k == 0` keeps every candidate.
pub fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    candidates: &[RerankCandidate],
    mode: RerankMode,
    top_k: usize,
) -> Result<Vec<Reranked>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let documents: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
    let logits = reranker.score(query, &documents)?;
    anyhow::ensure!(
        logits.len() == candidates.len(),
        "reranker returned {} scores for {} candidates",
        logits.len(),
        candidates.len()
    );

    let originals: Vec<f64> = candidates.iter().map(|c| c.score).collect();
    let normalized = min_max_normalize(&originals);

    let mut results: Vec<Reranked> = candidates
        .iter()
        .zip(logits)
        .zip(normalized)
        .map(|((candidate, logit), norm)| {
            let probability = sigmoid(logit as f64);
            let score = match mode {
                RerankMode::Pure => probability,
                RerankMode::Combined => {
                    ORIGINAL_WEIGHT * norm + CROSS_ENCODER_WEIGHT * probability
                }
            };
            Reranked {
                id: candidate.id.clone(),
                score,
            }
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    if top_k > 0 {
        results.truncate(top_k);
    }
    Ok(results)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Scale into `[0, 1]`. A constant input maps to all ones.
fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range <= f64::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// ms-marco-MiniLM-L-6-v2 cross-encoder over ONNX Runtime.
pub struct CrossEncoderReranker {
    model: OnnxModel,
}

impl CrossEncoderReranker {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(dir, MAX_SEQ_LEN)?,
        })
    }
}

impl Reranker for CrossEncoderReranker {
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let pairs: Vec<(String, String)> = documents
            .iter()
            .map(|doc| (query.to_string(), doc.clone()))
            .collect();
        let encodings = self.model.encode(pairs)?;
        let output = self.model.infer(&encodings, &["logits"])?;

        // [batch, 1] for single-logit relevance heads
        let stride = output.shape.get(1).copied().unwrap_or(1).max(1) as usize;
        Ok(output
            .data
            .chunks(stride)
            .take(documents.len())
            .map(|row| row[0])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores each document by how many times it contains the query.
    struct CountingReranker;

    impl Reranker for CountingReranker {
        fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
            Ok(documents
                .iter()
                .map(|d| d.matches(query).count() as f32 * 2.0 - 1.0)
                .collect())
        }
    }

    struct BrokenReranker;

    impl Reranker for BrokenReranker {
        fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
            Ok(vec![0.0])
        }
    }

    fn candidates() -> Vec<RerankCandidate> {
        vec![
            RerankCandidate {
                id: "a".into(),
                score: 0.9,
                text: "unrelated text".into(),
            },
            RerankCandidate {
                id: "b".into(),
                score: 0.6,
                text: "cache cache cache".into(),
            },
            RerankCandidate {
                id: "c".into(),
                score: 0.7,
                text: "one cache".into(),
            },
        ]
    }

    #[test]
    fn pure_mode_orders_by_cross_encoder() {
        let out = rerank(&CountingReranker, "cache", &candidates(), RerankMode::Pure, 0).unwrap();
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!((out[0].score - sigmoid(5.0)).abs() < 1e-9);
    }

    #[test]
    fn combined_mode_blends_original_score() {
        let out =
            rerank(&CountingReranker, "cache", &candidates(), RerankMode::Combined, 0).unwrap();
        let a = out.iter().find(|r| r.id == "a").unwrap();
        // a has the best original score (normalised to 1.0) and logit -1
        let expected = 0.3 * 1.0 + 0.7 * sigmoid(-1.0);
        assert!((a.score - expected).abs() < 1e-9);
        assert_eq!(out[0].id, "b");
    }

    #[test]
    fn top_k_truncates() {
        let out = rerank(&CountingReranker, "cache", &candidates(), RerankMode::Pure, 2).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn score_count_mismatch_is_an_error() {
        assert!(rerank(&BrokenReranker, "q", &candidates(), RerankMode::Pure, 0).is_err());
    }

    #[test]
    fn normalize_constant_input() {
        assert_eq!(min_max_normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[0.0, 0.5, 1.0]), vec![0.0, 0.5, 1.0]);
    }
}
