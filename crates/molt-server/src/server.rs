//! Process lifecycle: inherit or cold-start, listen, serve, then restart or stop.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use molt_ecdysis::{
    receive_connections, Bootstrap, ConnectionRegistry, CurrentExe, GracefulShutdown,
    RestartCoordinator, RestartGate, RestartReport, ShutdownSignal, SignalListener, Spawn,
};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::acceptor::{bind_listener, Acceptor, Dispatcher};
use crate::config::ServerConfig;

/// How a server run ended.
#[derive(Debug)]
pub enum Exit {
    /// A successor owns the listener and every transferred connection.
    Restarted(RestartReport),
    /// Graceful stop; `drained` is false if the drain timed out.
    Stopped { drained: bool },
}

pub struct Server<S> {
    config: ServerConfig,
    spawner: S,
}

impl<S: Spawn> Server<S> {
    pub fn new(config: ServerConfig, spawner: S) -> Self {
        Self { config, spawner }
    }

    /// Serve until a stop, or a successful restart.
    ///
    /// `triggers` delivers restart/stop requests; the channel closing counts
    /// as a stop. Only failing to bind the listening endpoint is an error.
    pub async fn run(self, mut triggers: mpsc::Receiver<ShutdownSignal>) -> anyhow::Result<Exit> {
        let config = self.config;
        let registry = Arc::new(ConnectionRegistry::new());
        let gate = RestartGate::new();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), gate.clone(), config.io_timeout);

        // Inherited connections are registered before the listener exists.
        let bootstrap = receive_connections(&config.control_path(), config.control_timeout, |fd| {
            dispatcher.adopt(fd)
        })
        .await;

        let listener = bind_listener(config.listen_addr)
            .with_context(|| format!("Failed to bind listening endpoint {}", config.listen_addr))?;
        let addr = listener.local_addr().unwrap_or(config.listen_addr);
        info!(addr = %addr, "Listening");

        if let Bootstrap::Inherited(inheritance) = bootstrap {
            let report = inheritance.release();
            info!(
                adopted = report.adopted,
                rejected = report.rejected,
                "Took over from predecessor"
            );
        }
        if let Err(e) = write_pid_file(&config.pid_path()) {
            warn!(path = %config.pid_path().display(), error = %e, "Failed to write pid file");
        }

        let shutdown = GracefulShutdown::new(config.drain_timeout);
        let acceptor = Acceptor::new(listener, dispatcher, gate.clone(), shutdown.stop_token());
        let sweeper = acceptor.sweeper();
        let mut acceptor_task =
            tokio::spawn(acceptor.run().instrument(info_span!("molt.acceptor", addr = %addr)));

        let coordinator = RestartCoordinator::new(
            config.restart_config(),
            Arc::clone(&registry),
            gate,
            self.spawner,
        );

        loop {
            let signal = triggers.recv().await.unwrap_or_else(|| {
                info!("Trigger channel closed; stopping");
                ShutdownSignal::Terminate
            });

            match signal {
                ShutdownSignal::Restart => {
                    let stop = shutdown.stop_token();
                    let acceptor = &mut acceptor_task;
                    let retire = || async move {
                        stop.cancel();
                        if let Err(e) = acceptor.await {
                            warn!(error = %e, "Accept loop ended abnormally");
                        }
                    };
                    let sweep = || sweeper.sweep();
                    // Failures are logged by the coordinator; keep serving.
                    if let Ok(report) = coordinator.restart(sweep, retire).await {
                        return Ok(Exit::Restarted(report));
                    }
                }
                ShutdownSignal::Terminate => {
                    info!("Stopping accept loop");
                    shutdown.trigger_stop();
                    if let Err(e) = (&mut acceptor_task).await {
                        warn!(error = %e, "Accept loop ended abnormally");
                    }
                    let drained = shutdown.drain(&registry).await;
                    remove_pid_file(&config.pid_path());
                    return Ok(Exit::Stopped { drained });
                }
            }
        }
    }
}

/// Run the real process: signal handlers, then [`Server::run`] with a
/// successor that re-executes this program.
pub async fn run_with_signals(config: ServerConfig) -> anyhow::Result<Exit> {
    // Installed before anything binds, so an early SIGUSR2 is queued
    // rather than fatal.
    let mut signals = SignalListener::install().context("Failed to install signal handlers")?;
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let signal = signals.recv().await;
            if tx.send(signal).await.is_err() {
                break;
            }
        }
    });

    Server::new(config, CurrentExe).run(rx).await
}

fn write_pid_file(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the pid file if it still names this process.
fn remove_pid_file(path: &Path) {
    let ours = std::fs::read_to_string(path)
        .map(|contents| contents.trim() == std::process::id().to_string())
        .unwrap_or(false);
    if ours {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        write_pid_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_of_successor_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        std::fs::write(&path, "4242424\n").unwrap();

        remove_pid_file(&path);
        assert!(path.exists());
    }
}
