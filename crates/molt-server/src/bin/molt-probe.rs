use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use molt_server::probe::{self, DEFAULT_PROBE_TIMEOUT};

#[derive(Parser, Debug)]
#[command(name = "molt-probe", version, about = "Send ping every interval and expect pong")]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: SocketAddr,

    /// Milliseconds between pings
    #[arg(long = "interval-ms", default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,

    /// Stop after this many exchanges (default: run until an error)
    #[arg(long)]
    count: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let exchanges = probe::run(
        cli.addr,
        Duration::from_millis(cli.interval_ms),
        cli.count,
        DEFAULT_PROBE_TIMEOUT,
    )
    .await?;
    tracing::info!(exchanges, "Probe finished");
    Ok(())
}
