use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use molt_server::{run_with_signals, telemetry, Args, Exit, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::from_env(&args).context("Failed to load server configuration")?;
    std::fs::create_dir_all(&config.workspace).with_context(|| {
        format!("Failed to create working directory {}", config.workspace.display())
    })?;

    telemetry::init(&config.log_path())?;

    info!("Molt Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("License: AGPL-3.0");
    config.log_config();

    match run_with_signals(config).await? {
        Exit::Restarted(report) => info!(
            successor_pid = ?report.successor_pid,
            transferred = report.transfer.transferred,
            "Successor took over; exiting"
        ),
        Exit::Stopped { drained } => info!(drained, "Stopped"),
    }

    Ok(())
}
