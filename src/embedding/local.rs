//! Local all-MiniLM-L6-v2 sentence embedder.
//!
//! Runs the model through [`OnnxModel`] and mean-pools token embeddings under
//! the attention mask, then L2-normalizes.

use std::path::Path;

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::onnx::OnnxModel;

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

pub struct LocalEmbeddingProvider {
    model: OnnxModel,
}

impl LocalEmbeddingProvider {
    /// Load the model from a directory holding `model.onnx` and `tokenizer.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            model: OnnxModel::load(dir, MAX_SEQ_LEN)?,
        })
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self.model.encode(texts.to_vec())?;
        let output = self
            .model
            .infer(&encodings, &["token_embeddings", "last_hidden_state"])?;

        anyhow::ensure!(
            output.shape.len() == 3 && output.shape[2] == EMBEDDING_DIM as i64,
            "unexpected token_embeddings shape: {:?}, expected [batch, seq, {EMBEDDING_DIM}]",
            output.shape
        );
        let seq_len = output.shape[1] as usize;
        let masks: Vec<&[u32]> = encodings.iter().map(|e| e.get_attention_mask()).collect();

        Ok(masks
            .iter()
            .enumerate()
            .map(|(b, mask)| mean_pool(&output.data, b, seq_len, EMBEDDING_DIM, mask))
            .map(|pooled| l2_normalize(&pooled))
            .collect())
    }
}

/// Average the token vectors of batch row `b` whose mask is set.
fn mean_pool(data: &[f32], b: usize, seq_len: usize, hidden: usize, mask: &[u32]) -> Vec<f32> {
    let mut sum = vec![0.0f32; hidden];
    let mut count = 0.0f32;
    for (s, &m) in mask.iter().take(seq_len).enumerate() {
        if m == 0 {
            continue;
        }
        let offset = (b * seq_len + s) * hidden;
        for (d, acc) in sum.iter_mut().enumerate() {
            *acc += data[offset + d];
        }
        count += 1.0;
    }
    if count > 0.0 {
        sum.iter_mut().for_each(|x| *x /= count);
    }
    sum
}
