//! CLI `doctor` command: database and model diagnostics.

use anyhow::{Context, Result};

use crate::config::MemoriaConfig;
use crate::db;

/// Print a health report for the database and the local models.
pub fn doctor(config: &MemoriaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    println!("memoria health report");
    println!("=====================");
    println!();
    let config_file = config
        .config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".into());
    println!("Config:            {config_file}");

    if !db_path.exists() {
        println!("Database:          not found at {}", db_path.display());
        println!("Run `memoria serve` to initialize.");
    } else {
        let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        let conn = db::open_database(&db_path)
            .context("failed to open database (may be corrupt)")?;
        let report = db::check_database_health(&conn).context("failed to run health check")?;

        println!("Database:          {}", db_path.display());
        println!("File size:         {}", format_bytes(file_size));
        println!("Schema version:    {}", report.schema_version);
        println!("sqlite-vec:        v{}", report.sqlite_vec_version);
        println!(
            "Embedding model:   {} (configured: {})",
            report.embedding_model.as_deref().unwrap_or("(not set)"),
            config.embedding.model
        );
        println!();
        println!("Row counts:");
        println!("  Sessions:        {}", report.session_count);
        println!("  Observations:    {}", report.observation_count);
        println!("  Summaries:       {}", report.summary_count);
        println!();
        if report.integrity_ok {
            println!("Integrity check:   PASSED");
        } else {
            println!("Integrity check:   FAILED ({})", report.integrity_details);
            println!("Delete the database file; the daemon recreates it on the fly.");
        }
    }

    println!();
    println!("Models:");
    let models_dir = config.model_dir();
    let models = [
        ("embedding", config.embedding.model.as_str(), true),
        ("reranker", config.rerank.model.as_str(), config.rerank.enabled),
    ];
    for (role, name, enabled) in models {
        let dir = models_dir.join(name);
        let present = dir.join("model.onnx").exists() && dir.join("tokenizer.json").exists();
        let status = match (present, enabled) {
            (true, _) => "OK",
            (false, true) => "MISSING (run `memoria model download`)",
            (false, false) => "not downloaded (disabled)",
        };
        println!("  {role:<10} {name:<24} {status}");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
