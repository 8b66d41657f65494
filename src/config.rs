use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoriaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub expansion: ExpansionConfig,
    pub queue: QueueConfig,
    /// Path the config was loaded from. Watched by the supervisor.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum cosine similarity for vector candidates, before the 0.9 discount.
    pub relevance_threshold: f64,
    /// Cap on search results, applied after sorting. Zero disables the cap.
    pub max_prompt_results: usize,
    /// How many recent observations the inject path considers.
    pub context_observations: usize,
    /// How many inject results the caller should render in full.
    pub context_full_count: usize,
    /// Jaccard similarity at or above which two observations are near-duplicates.
    pub cluster_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    /// Cross-encoder score only, instead of blending with the vector score.
    pub pure: bool,
    /// Keep at most this many reranked results. 0 keeps all.
    pub top_k: usize,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExpansionConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub tick_ms: u64,
}

impl Default for MemoriaConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            expansion: ExpansionConfig::default(),
            queue: QueueConfig::default(),
            source_path: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 37777,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_memoria_dir()
            .join("memoria.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_memoria_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.5,
            max_prompt_results: 50,
            context_observations: 100,
            context_full_count: 25,
            cluster_threshold: 0.4,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pure: false,
            top_k: 0,
            model: "ms-marco-MiniLM-L-6-v2".into(),
        }
    }
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { tick_ms: 2000 }
    }
}

/// Returns `~/.memoria/`
pub fn default_memoria_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".memoria")
}

/// Returns the default config file path: `~/.memoria/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memoria_dir().join("config.toml")
}

impl MemoriaConfig {
    /// Load config from `MEMORIA_CONFIG` or the default path, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MEMORIA_CONFIG")
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|_| default_config_path());
        Self::load_from(path)
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoriaConfig::default()
        };

        config.source_path = Some(path.to_path_buf());
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MEMORIA_DB, MEMORIA_PORT, MEMORIA_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORIA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MEMORIA_PORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMORIA_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// The settings file the daemon was started with, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Resolved model cache directory.
    pub fn model_dir(&self) -> PathBuf {
        expand_tilde(&self.embedding.cache_dir)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
