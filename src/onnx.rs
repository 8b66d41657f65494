//! Shared ONNX Runtime plumbing for the local models.
//!
//! Both the sentence embedder and the cross-encoder reranker are BERT-style
//! models taking `input_ids`, `attention_mask` and `token_type_ids`. [`OnnxModel`]
//! loads a model directory (`model.onnx` + `tokenizer.json`), tokenizes batches
//! and returns the first matching output tensor as owned data.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{EncodeInput, Encoding, Tokenizer};

pub struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
unsafe impl Send for OnnxModel {}
unsafe impl Sync for OnnxModel {}

/// An inference output copied out of the session.
pub struct OutputTensor {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

impl OnnxModel {
    /// Load `model.onnx` and `tokenizer.json` from `dir`.
    pub fn load(dir: &Path, max_seq_len: usize) -> Result<Self> {
        let model_path = dir.join("model.onnx");
        let tokenizer_path = dir.join("tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Run `memoria model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}. Run `memoria model download` first.",
            tokenizer_path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: max_seq_len,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    /// Tokenize a batch of single texts or text pairs.
    pub fn encode<'s, E>(&self, inputs: Vec<E>) -> Result<Vec<Encoding>>
    where
        E: Into<EncodeInput<'s>> + Send,
    {
        self.tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))
    }

    /// Run the model over padded encodings and copy out the first output whose
    /// name is in `output_names` (falling back to output 0).
    pub fn infer(&self, encodings: &[Encoding], output_names: &[&str]) -> Result<OutputTensor> {
        anyhow::ensure!(!encodings.is_empty(), "empty inference batch");
        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut token_type_ids = Vec::with_capacity(batch_size * seq_len);
        for encoding in encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&v| v as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&v| v as i64));
            token_type_ids.extend(encoding.get_type_ids().iter().map(|&v| v as i64));
        }

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids = Tensor::from_array((shape.clone(), input_ids.into_boxed_slice()))?;
        let attention_mask = Tensor::from_array((shape.clone(), attention_mask.into_boxed_slice()))?;
        let token_type_ids = Tensor::from_array((shape, token_type_ids.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;

        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        let value = output_names
            .iter()
            .find_map(|name| outputs.get(*name))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract output tensor")?;
        let dims: &[i64] = &shape;

        Ok(OutputTensor {
            shape: dims.to_vec(),
            data: data.to_vec(),
        })
    }
}
