//! Local memory daemon for coding assistants.
//!
//! memoria records what an assistant does during a session as observations,
//! then serves the most relevant ones back as context for later prompts.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//! - **Retrieval**: query expansion, vector search with full-text and recency
//!   fallbacks, staleness filtering, cross-encoder reranking and near-duplicate
//!   clustering
//! - **Runtime**: a 2 second queue processor, a stale-verification worker and a
//!   file-watching supervisor that rebuilds the store if its file disappears
//! - **Transport**: JSON over HTTP on localhost, plus an SSE status stream
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: schema, migrations and health checks
//! - [`memory`]: persisted observations, sessions, prompts and summaries
//! - [`retrieval`]: the search and inject pipelines
//! - [`service`]: component lifecycle, reinitialization and shutdown
//! - [`server`]: HTTP routes

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod expansion;
pub mod memory;
pub mod onnx;
pub mod privacy;
pub mod processor;
pub mod queue;
pub mod rerank;
pub mod retrieval;
pub mod server;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod vector;
pub mod worker;
