//! Drift Monitor Daemon
//!
//! Scores the latest meter window against the deployed model, and on drift
//! ships evidence for retraining and waits for the replacement model.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use drift_common::config::SYSTEM_CONFIG_PATH;
use drift_common::MonitorConfig;
use driftd::predictor::JsonModelLoader;
use driftd::shutdown::{listen_for_signals, Shutdown};
use driftd::status::load_status;
use driftd::transport::{LocalStreamConnector, LocalStreamManager};
use driftd::watcher::FsArtifactClock;
use driftd::window_source::SqliteWindowSource;
use driftd::{Collaborators, Orchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { cycles } => {
            let (config, source) = MonitorConfig::load_located(cli.config.as_deref())?;
            init_logging(&config.daemon.log_level);
            match source {
                Some(path) => info!("Loaded config from {}", path.display()),
                None => info!("No config file found, using defaults"),
            }
            run(config, cycles).await
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH));
            init_config(&path)
        }
        Commands::CheckConfig => {
            let config = MonitorConfig::load(cli.config.as_deref())?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render configuration")?
            );
            println!("# configuration is valid");
            Ok(())
        }
        Commands::Status { json } => {
            let config = MonitorConfig::load(cli.config.as_deref())?;
            show_status(&config, json).await
        }
    }
}

fn init_logging(default_level: &str) {
    // RUST_LOG wins over the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: MonitorConfig, cycles: Option<u64>) -> Result<()> {
    info!("Drift monitor v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Store {}, model {}, threshold {}, window {}",
        config.store.db_path.display(),
        config.model.path.display(),
        config.drift.threshold,
        config.drift.window_size
    );

    let (handle, shutdown) = Shutdown::new();
    tokio::spawn(listen_for_signals(handle));

    let streams = LocalStreamManager::new(&config.upload.export_root);
    let parts = Collaborators {
        source: Arc::new(SqliteWindowSource::new(&config.store.db_path)),
        loader: Arc::new(JsonModelLoader),
        connector: Arc::new(LocalStreamConnector::new(streams)),
        clock: Arc::new(FsArtifactClock),
    };

    let mut orchestrator = Orchestrator::new(config, parts, shutdown);
    let stats = match cycles {
        Some(n) => orchestrator.run_cycles(n).await,
        None => orchestrator.run().await,
    }
    .context("Drift monitor stopped with an error")?;

    info!(
        "Drift monitor stopped: {} cycles scored, {} drift events, {} uploads ok, {} failed",
        stats.cycles_scored, stats.drift_events, stats.uploads_succeeded, stats.uploads_failed
    );
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", path.display());
    }
    MonitorConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn show_status(config: &MonitorConfig, json: bool) -> Result<()> {
    let Some(path) = config.daemon.status_file.as_deref() else {
        anyhow::bail!("daemon.status_file is not set; the monitor does not record its status");
    };

    match load_status(path).await? {
        Some(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
        Some(status) => print!("{}", status.summary()),
        None => println!("No status recorded yet at {}", path.display()),
    }
    Ok(())
}
