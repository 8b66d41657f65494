use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memoria::config::{expand_tilde, MemoriaConfig};
use memoria::service::{Backends, Service};
use memoria::{cli, server, supervisor};

/// Deadline handed to each shutdown step.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "memoria", version, about = "Local memory daemon for coding assistants")]
struct Cli {
    /// Config file (default: $MEMORIA_CONFIG or ~/.memoria/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP daemon
    Serve,
    /// Manage the local ONNX models
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Check database and model health
    Doctor,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding and reranker models to the model cache
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MemoriaConfig::load_from(expand_tilde(path))?,
        None => MemoriaConfig::load()?,
    };

    // Log to stderr; stdout belongs to the CLI commands.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config).await?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}

async fn serve(config: MemoriaConfig) -> Result<()> {
    let addr = config.bind_addr();
    let config_file = config.config_path().map(PathBuf::from);
    tracing::info!(
        addr = %addr,
        config = ?config_file,
        db = %config.resolved_db_path().display(),
        "starting memoria"
    );

    let backends = Backends::load(&config);
    let service = Service::new(config, backends)?;
    let listener = server::bind(&addr).await?;

    service.start();
    match supervisor::start(service.clone()) {
        Ok(handle) => service.attach_watcher(handle),
        Err(e) => tracing::warn!(error = %e, "file watching unavailable, self-healing disabled"),
    }
    server::spawn(service.clone(), listener);

    let token = service.token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("interrupt received");
        }
        _ = token.cancelled() => {
            if service.exit_requested() {
                tracing::info!("settings changed, exiting for restart");
            }
        }
    }

    service.shutdown(SHUTDOWN_DEADLINE).await;
    Ok(())
}
