//! Server configuration.
//!
//! The working directory comes from the command line; everything else from
//! environment variables. A successor is spawned with the same arguments and
//! environment, so it resolves the same configuration as its predecessor.
//!
//! # Environment Variables
//!
//! - `MOLT_LISTEN_ADDR`: Listening address. Default: `0.0.0.0:7000`
//! - `MOLT_IO_TIMEOUT_SECS`: Per-connection read/write deadline. Default: `5`
//! - `MOLT_CONTROL_TIMEOUT_SECS`: Control-channel deadline. Default: `180`
//! - `MOLT_DRAIN_TIMEOUT_SECS`: Drain timeout on graceful stop. Default: `30`

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use molt_ecdysis::control::CONTROL_SOCKET_NAME;
use molt_ecdysis::RestartConfig;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7000));
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CONTROL_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

const LOG_FILE_NAME: &str = "server.log";
const PID_FILE_NAME: &str = "server.pid";

/// Command-line arguments of `molt-server`.
#[derive(Parser, Debug, Clone)]
#[command(name = "molt-server", version, about = "Ping/pong server that restarts on SIGUSR2 without dropping connections")]
pub struct Args {
    /// Working directory holding the control socket, log and pid file
    #[arg(short = 'w', long = "workspace", default_value = ".")]
    pub workspace: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid socket address")]
    InvalidAddr { var: &'static str, value: String },

    #[error("{var}={value:?} is not a whole number of seconds")]
    InvalidSeconds { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    ZeroTimeout { var: &'static str },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Working directory for the control socket, log and pid file
    pub workspace: PathBuf,
    pub listen_addr: SocketAddr,
    /// Deadline for each liveness read/write
    pub io_timeout: Duration,
    /// Deadline for each control-channel step of a restart
    pub control_timeout: Duration,
    /// How long a graceful stop waits for connections to close
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Build the configuration from parsed arguments and the process environment.
    pub fn from_env(args: &Args) -> Result<Self, ConfigError> {
        Self::from_lookup(&args.workspace, |var| std::env::var(var).ok())
    }

    /// Build the configuration with `lookup` standing in for the environment.
    pub fn from_lookup(
        workspace: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let listen_addr = match lookup("MOLT_LISTEN_ADDR") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidAddr {
                var: "MOLT_LISTEN_ADDR",
                value,
            })?,
            None => DEFAULT_LISTEN_ADDR,
        };

        Ok(Self {
            workspace: workspace.to_path_buf(),
            listen_addr,
            io_timeout: seconds(&lookup, "MOLT_IO_TIMEOUT_SECS", DEFAULT_IO_TIMEOUT_SECS)?,
            control_timeout: seconds(
                &lookup,
                "MOLT_CONTROL_TIMEOUT_SECS",
                DEFAULT_CONTROL_TIMEOUT_SECS,
            )?,
            drain_timeout: seconds(&lookup, "MOLT_DRAIN_TIMEOUT_SECS", DEFAULT_DRAIN_TIMEOUT_SECS)?,
        })
    }

    pub fn control_path(&self) -> PathBuf {
        self.workspace.join(CONTROL_SOCKET_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.workspace.join(LOG_FILE_NAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.workspace.join(PID_FILE_NAME)
    }

    pub fn restart_config(&self) -> RestartConfig {
        RestartConfig {
            control_path: self.control_path(),
            control_timeout: self.control_timeout,
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!(workspace = %self.workspace.display(), "Working directory");
        info!(addr = %self.listen_addr, "Listening address");
        info!(
            io_timeout_secs = self.io_timeout.as_secs(),
            control_timeout_secs = self.control_timeout.as_secs(),
            drain_timeout_secs = self.drain_timeout.as_secs(),
            "Timeouts"
        );
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidSeconds { var, value })?,
        None => default,
    };
    if secs == 0 {
        return Err(ConfigError::ZeroTimeout { var });
    }
    Ok(Duration::from_secs(secs))
}
