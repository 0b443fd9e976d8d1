//! Process signals and graceful stop.
//!
//! - `SIGUSR2` → restart (spawn successor, hand off connections, exit)
//! - `SIGTERM` / `SIGINT` → stop accepting, drain, exit
//!
//! Uses `CancellationToken` to stop the accept loop and the
//! [`ConnectionRegistry`] for drain tracking.

use std::io;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

/// What a process signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM or SIGINT: graceful stop (drain and exit).
    Terminate,
    /// SIGUSR2: hand everything to a successor and exit.
    Restart,
}

/// Installed signal handlers.
///
/// Install before binding anything, so a signal that arrives during startup
/// is queued instead of killing the process.
pub struct SignalListener {
    terminate: Signal,
    interrupt: Signal,
    restart: Signal,
}

impl SignalListener {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            restart: signal(SignalKind::user_defined2())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.terminate.recv() => {
                info!("Received SIGTERM; initiating graceful stop");
                ShutdownSignal::Terminate
            }
            _ = self.interrupt.recv() => {
                info!("Received SIGINT; initiating graceful stop");
                ShutdownSignal::Terminate
            }
            _ = self.restart.recv() => {
                info!("Received SIGUSR2; initiating restart");
                ShutdownSignal::Restart
            }
        }
    }
}

/// Coordinator for graceful stop with connection draining.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    /// Token cancelled when the server should stop accepting new connections.
    stop_accepting: CancellationToken,

    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// A `CancellationToken` that fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Wait for every registered connection to close, or the drain timeout.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self, registry: &ConnectionRegistry) -> bool {
        let active = registry.len();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining active connections"
        );

        tokio::select! {
            _ = registry.wait_empty() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    remaining_connections = registry.len(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Drain timeout expired, force-exiting"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_graceful_drain() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let stop_token = shutdown.stop_token();

        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        let guard1 = registry.register(&a).unwrap();
        let guard2 = registry.register(&b).unwrap();
        assert_eq!(registry.len(), 2);

        shutdown.trigger_stop();
        assert!(stop_token.is_cancelled());

        let drain = {
            let shutdown = shutdown.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { shutdown.drain(&registry).await })
        };
        drop(guard1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard2);

        assert!(drain.await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = GracefulShutdown::new(Duration::from_millis(100));

        let (a, _a_peer) = UnixStream::pair().unwrap();
        let _guard = registry.register(&a).unwrap();

        shutdown.trigger_stop();

        let drained = shutdown.drain(&registry).await;
        assert!(!drained);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_drains_immediately() {
        let registry = ConnectionRegistry::new();
        let shutdown = GracefulShutdown::new(Duration::from_secs(60));
        assert!(shutdown.drain(&registry).await);
    }
}
