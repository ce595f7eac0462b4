//! futurescan - multi-exchange perpetual-futures market-data collector.
//!
//! Polls the configured exchanges for tickers and funding rates, publishes
//! changed snapshots to an AMQP topic exchange, and serves a runtime control
//! queue for mutating the working symbol set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futurescan::application::orchestrator::Orchestrator;
use futurescan::config::{AppConfig, LoggingConfig};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "futurescan",
    version,
    about = "Multi-exchange futures market-data collector"
)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment override (development/staging/production)
    #[arg(short, long)]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref(), args.environment.as_deref())?;
    init_logging(&config.logging)?;

    info!("futurescan {} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Environment: {}, exchanges: {}",
        config.environment,
        config.exchanges.join(", ")
    );

    let mut orchestrator = Orchestrator::build(config).await?;
    orchestrator.start().await?;
    info!("futurescan running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    orchestrator.stop().await;
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    let file_layer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
