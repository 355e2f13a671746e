use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coderelay::config::Config;
use coderelay::project::ProjectStore;
use coderelay::provider::ProviderRegistry;
use coderelay::session::SessionRegistry;
use coderelay::store::{FileBlobStore, SnapshotWriter};

/// Interval between session retention sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(version, about = "Streaming session core bridging chat front ends to coding-agent backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session core.
    Serve {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "coderelay.toml")]
        config: PathBuf,
    },

    /// List persisted sessions and exit.
    Sessions {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "coderelay.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Sessions { config } => list_sessions(config).await,
    }
}

async fn build_registry(config_path: &PathBuf) -> Result<(SessionRegistry, Arc<Config>)> {
    // Invalid required settings are fatal here; nothing past startup is.
    let config = Arc::new(
        Config::load(config_path)
            .await
            .with_context(|| format!("loading {}", config_path.display()))?,
    );

    let store = Arc::new(FileBlobStore::new(&config.data_dir));
    let writer = SnapshotWriter::spawn(store.clone());
    let providers = Arc::new(ProviderRegistry::new());
    let projects = ProjectStore::load(writer.clone(), store.as_ref()).await;
    let registry = SessionRegistry::new(providers, projects, writer, config.clone());
    registry.load(store.as_ref()).await;

    Ok((registry, config))
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let (registry, _config) = build_registry(&config_path).await?;

    let adopted = registry.sync_orphans().await;
    if !adopted.is_empty() {
        info!(count = adopted.len(), "adopted orphaned sessions");
    }

    // Retention sweep runs for the life of the process; chat platform
    // gateways drive the registry through the library API.
    let sweeper = registry.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweeper.expire_inactive().await;
        }
    });

    info!("coderelay running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }

    sweep.abort();
    registry.shutdown().await;
    Ok(())
}

async fn list_sessions(config_path: PathBuf) -> Result<()> {
    let (registry, _config) = build_registry(&config_path).await?;

    let sessions = registry.all().await;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {}  {}  {}  ${:.4}",
            session.id,
            session.provider,
            session.mode,
            session.directory.display(),
            session.total_cost,
        );
    }
    Ok(())
}
