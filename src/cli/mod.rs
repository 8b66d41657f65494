pub mod doctor;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::MemoriaConfig;

/// A downloadable ONNX model: weights plus tokenizer.
struct ModelSpec {
    name: &'static str,
    model_url: &'static str,
    tokenizer_url: &'static str,
    approx_size: &'static str,
}

const KNOWN_MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "all-MiniLM-L6-v2",
        model_url: "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx",
        tokenizer_url: "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
        approx_size: "~90MB",
    },
    ModelSpec {
        name: "ms-marco-MiniLM-L-6-v2",
        model_url: "https://huggingface.co/cross-encoder/ms-marco-MiniLM-L-6-v2/resolve/main/onnx/model.onnx",
        tokenizer_url: "https://huggingface.co/cross-encoder/ms-marco-MiniLM-L-6-v2/resolve/main/tokenizer.json",
        approx_size: "~90MB",
    },
];

fn spec_for(name: &str) -> Result<&'static ModelSpec> {
    match KNOWN_MODELS.iter().find(|m| m.name == name) {
        Some(spec) => Ok(spec),
        None => bail!(
            "no download source for model {name}. Known: {}",
            KNOWN_MODELS.iter().map(|m| m.name).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Download the embedding model and, if reranking is enabled, the
/// cross-encoder into `<cache_dir>/<model name>/`.
pub async fn model_download(config: &MemoriaConfig) -> Result<()> {
    let cache_dir = config.model_dir();
    let mut wanted = vec![config.embedding.model.as_str()];
    if config.rerank.enabled {
        wanted.push(config.rerank.model.as_str());
    }

    for name in wanted {
        let spec = spec_for(name)?;
        download_model(spec, &cache_dir.join(spec.name)).await?;
    }

    println!("Model download complete. Ready for use.");
    Ok(())
}

async fn download_model(spec: &ModelSpec, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create model dir: {}", dir.display()))?;

    let model_path = dir.join("model.onnx");
    let tokenizer_path = dir.join("tokenizer.json");

    if model_path.exists() {
        println!("{}: model already exists at {}", spec.name, model_path.display());
    } else {
        println!("{}: downloading model.onnx ({})...", spec.name, spec.approx_size);
        download_file(spec.model_url, &model_path).await?;
        println!("{}: model saved to {}", spec.name, model_path.display());
    }

    if tokenizer_path.exists() {
        println!("{}: tokenizer already exists at {}", spec.name, tokenizer_path.display());
    } else {
        println!("{}: downloading tokenizer.json...", spec.name);
        download_file(spec.tokenizer_url, &tokenizer_path).await?;
        println!("{}: tokenizer saved to {}", spec.name, tokenizer_path.display());
    }
    Ok(())
}

/// Stream a URL to disk with a progress bar. Writes to a temp file and
/// renames on success.
async fn download_file(url: &str, dest: &PathBuf) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .context("invalid progress template")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error reading response")?;
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}
