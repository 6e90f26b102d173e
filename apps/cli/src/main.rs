//! vidvault command line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Resumable video downloads with automatic expiry.
#[derive(Debug, Parser)]
#[command(name = "vidvault", version, about)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download or resume one or more URLs. Ctrl-C pauses them.
    Get {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Discard saved progress and start again from zero.
        #[arg(long)]
        retry: bool,
    },
    /// Show every known transfer.
    List,
    /// Remove expired downloads now.
    Sweep,
    /// Delete a download and its file.
    Delete { url: String },
    /// Stop a transfer and forget its saved progress.
    Cancel { url: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::debug!(
        state_dir = %config.scheduler.state_dir.display(),
        artifact_dir = %config.scheduler.artifact_dir.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli.command, config))
}
