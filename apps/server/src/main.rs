//! Vigil Server - headless RTSP monitoring and analysis daemon.
//!
//! Supervises the per-stream transcoders, drives the capture/analysis
//! scheduler, and shuts everything down cleanly on Ctrl+C or SIGTERM.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use vigil_core::bootstrap_services;

use crate::config::ServerConfig;

/// Vigil Server - RTSP stream monitoring with vision-model analysis.
#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Base URL of the control-plane CRUD service (overrides config file).
    #[arg(short = 'a', long, env = "API_BASE_URL")]
    api_base_url: Option<String>,

    /// Screenshot capture interval in seconds (overrides config file).
    #[arg(long)]
    capture_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Vigil Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(url) = args.api_base_url {
        config.api_base_url = url;
    }
    if let Some(interval) = args.capture_interval {
        config.capture_interval_secs = interval;
    }

    log::info!(
        "Configuration: api={}, grid={}x{}, capture every {}s, verify every {}s",
        config.api_base_url,
        config.grid_rows,
        config.grid_cols,
        config.capture_interval_secs,
        config.verify_interval_secs
    );

    // Bootstrap services; fails fast on missing credentials
    let core_config = config.to_core_config();
    let services = bootstrap_services(&core_config).context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Start the transcoders and the recurring scheduler loops
    services.start().await;

    log::info!("Scheduler started");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: cancel loops, TERM every transcoder process group,
    // reclaim scratch space
    services.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
