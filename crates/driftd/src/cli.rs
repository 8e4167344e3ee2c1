//! CLI - Command-line argument parsing
//!
//! Keeps argument parsing separate from execution logic.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Edge drift monitor
#[derive(Parser)]
#[command(name = "driftd")]
#[command(
    about = "Drift-triggered retraining monitor for edge forecasting models",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Config file (overrides $DRIFTD_CONFIG and /etc/driftd/config.toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the monitoring loop until interrupted
    Run {
        /// Stop after this many completed cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Write a config file with every default spelled out
    InitConfig {
        /// Destination (default: /etc/driftd/config.toml)
        path: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Print the status last written by a running monitor
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },
}
