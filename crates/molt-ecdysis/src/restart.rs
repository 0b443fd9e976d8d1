//! Restart coordinator.
//!
//! Drives one restart attempt in the old process:
//!
//! ```text
//! IDLE → PREPARING → SPAWNING → ACCEPTING_PEER → TRANSFERRING → RETIRING
//!          │            │             │                │
//!          └────────────┴─────────────┴────────────────┴──→ IDLE (aborted)
//! ```
//!
//! Any failure before RETIRING reopens the gate, so the acceptor and the
//! handlers carry on as if nothing happened. Connections whose descriptor was
//! already sent stay usable here: the successor only ever got a duplicate.

use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::control::{ControlListener, ControlSender};
use crate::gate::RestartGate;
use crate::registry::{ConnectionRegistry, RegisteredConnection};
use crate::spawn::{Spawn, Successor};

/// Grace period between the channel closing and checking the successor is alive.
const SUCCESSOR_SETTLE: Duration = Duration::from_millis(100);

/// Coordinator states, used for logging and error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Preparing,
    Spawning,
    AcceptingPeer,
    Transferring,
    Retiring,
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestartState::Idle => "idle",
            RestartState::Preparing => "preparing",
            RestartState::Spawning => "spawning",
            RestartState::AcceptingPeer => "accepting_peer",
            RestartState::Transferring => "transferring",
            RestartState::Retiring => "retiring",
        };
        f.write_str(name)
    }
}

/// Why a restart attempt was abandoned. The old process keeps serving.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("a restart is already in progress")]
    InProgress,

    #[error("failed to bind control channel at {}: {source}", path.display())]
    ControlBind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn successor: {0}")]
    Spawn(#[source] io::Error),

    #[error("successor {pid:?} never connected to the control channel: {source}")]
    PeerConnect {
        pid: Option<u32>,
        #[source]
        source: io::Error,
    },

    #[error("transfer task failed: {0}")]
    TransferTask(#[from] tokio::task::JoinError),

    #[error("successor {pid:?} did not confirm its listener: {source}")]
    PeerConfirm {
        pid: Option<u32>,
        #[source]
        source: io::Error,
    },

    #[error("successor {pid:?} exited during the hand-off")]
    SuccessorExited { pid: Option<u32> },
}

impl RestartError {
    /// The state the attempt was in when it failed.
    pub fn state(&self) -> RestartState {
        match self {
            RestartError::InProgress => RestartState::Idle,
            RestartError::ControlBind { .. } => RestartState::Preparing,
            RestartError::Spawn(_) => RestartState::Spawning,
            RestartError::PeerConnect { .. } => RestartState::AcceptingPeer,
            RestartError::TransferTask(_)
            | RestartError::PeerConfirm { .. }
            | RestartError::SuccessorExited { .. } => RestartState::Transferring,
        }
    }
}

/// Outcome of streaming the registry to the successor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Descriptors sent.
    pub transferred: usize,
    /// Connections alive when the restart began that closed before their turn.
    pub skipped: usize,
    /// Sends that failed; those connections stay with this process.
    pub failed: usize,
    /// Whether the done sentinel went out.
    pub sentinel_sent: bool,
}

/// A completed restart.
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub successor_pid: Option<u32>,
    /// Connections taken off the listener backlog for the transfer.
    pub swept: usize,
    pub transfer: TransferReport,
}

#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Where the control socket is created.
    pub control_path: PathBuf,
    /// Deadline for every control-channel step (peer connect, each send,
    /// listener confirmation).
    pub control_timeout: Duration,
}

/// Owns the restart state machine for one process.
pub struct RestartCoordinator<S> {
    config: RestartConfig,
    registry: Arc<ConnectionRegistry>,
    gate: RestartGate,
    spawner: S,
}

impl<S: Spawn> RestartCoordinator<S> {
    pub fn new(
        config: RestartConfig,
        registry: Arc<ConnectionRegistry>,
        gate: RestartGate,
        spawner: S,
    ) -> Self {
        Self {
            config,
            registry,
            gate,
            spawner,
        }
    }

    pub fn gate(&self) -> &RestartGate {
        &self.gate
    }

    /// Run one restart attempt.
    ///
    /// `sweep` runs once the successor is connected, just before the
    /// transfer; it must register whatever is waiting in the listener's
    /// backlog and return how many it took. On success `retire` is awaited
    /// before returning; it must close the listening endpoint. The caller is
    /// then expected to exit. On failure the gate is reopened and nothing
    /// else changes.
    pub async fn restart<W, WFut, F, Fut>(
        &self,
        sweep: W,
        retire: F,
    ) -> Result<RestartReport, RestartError>
    where
        W: FnOnce() -> WFut,
        WFut: Future<Output = usize>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.gate.begin() {
            warn!("Restart requested while one is in progress; ignoring");
            return Err(RestartError::InProgress);
        }
        // Everything alive now is offered, even if it closes before its turn.
        let enrolled = self.registry.snapshot();

        let report = match self.hand_off(enrolled, sweep).await {
            Ok(report) => report,
            Err(e) => {
                self.gate.abort();
                warn!(state = %e.state(), error = %e, "Restart aborted; resuming service");
                return Err(e);
            }
        };

        info!(
            state = %RestartState::Retiring,
            successor_pid = ?report.successor_pid,
            "Closing listening endpoint"
        );
        retire().await;
        info!(
            successor_pid = ?report.successor_pid,
            swept = report.swept,
            transferred = report.transfer.transferred,
            skipped = report.transfer.skipped,
            failed = report.transfer.failed,
            "Restart complete; successor owns all traffic"
        );
        Ok(report)
    }

    async fn hand_off<W, WFut>(
        &self,
        mut snapshot: Vec<RegisteredConnection>,
        sweep: W,
    ) -> Result<RestartReport, RestartError>
    where
        W: FnOnce() -> WFut,
        WFut: Future<Output = usize>,
    {
        let path = &self.config.control_path;
        info!(state = %RestartState::Preparing, path = %path.display(), "Creating control channel");
        let listener = ControlListener::bind(path).map_err(|source| RestartError::ControlBind {
            path: path.clone(),
            source,
        })?;

        info!(state = %RestartState::Spawning, "Launching successor");
        let mut successor = match self.spawner.spawn() {
            Ok(successor) => successor,
            Err(e) => {
                listener.destroy();
                return Err(RestartError::Spawn(e));
            }
        };
        let pid = successor.id();

        info!(state = %RestartState::AcceptingPeer, successor_pid = ?pid, "Waiting for successor");
        let sender = match listener.accept_peer(self.config.control_timeout).await {
            Ok(sender) => sender,
            Err(source) => {
                discard(&mut successor);
                listener.destroy();
                return Err(RestartError::PeerConnect { pid, source });
            }
        };
        // One peer per channel; the path stays until the next cycle.
        drop(listener);

        info!(state = %RestartState::Transferring, successor_pid = ?pid, "Streaming connections");
        let swept = sweep().await;
        if swept > 0 {
            debug!(swept, "Took queued connections off the listener backlog");
        }
        // Late registrations: the backlog sweep, and any accept that raced the gate.
        self.registry.extend_snapshot(&mut snapshot);
        let transfer = tokio::spawn(
            async move {
                let report = transfer_connections(&sender, snapshot).await;
                (sender, report)
            }
            .instrument(info_span!("molt.restart.transfer", successor_pid = ?pid)),
        );
        let (mut sender, transfer) = match transfer.await {
            Ok(done) => done,
            Err(e) => {
                discard(&mut successor);
                return Err(RestartError::TransferTask(e));
            }
        };

        if let Err(source) = sender.wait_peer_closed().await {
            discard(&mut successor);
            return Err(RestartError::PeerConfirm { pid, source });
        }
        // A successor that failed to bind also closes the channel, by exiting.
        tokio::time::sleep(SUCCESSOR_SETTLE).await;
        if successor.has_exited().unwrap_or(false) {
            return Err(RestartError::SuccessorExited { pid });
        }
        debug!(successor_pid = ?pid, "Successor confirmed its listener");

        Ok(RestartReport {
            successor_pid: pid,
            swept,
            transfer,
        })
    }
}

fn discard(successor: &mut impl Successor) {
    if let Err(e) = successor.kill() {
        warn!(successor_pid = ?successor.id(), error = %e, "Failed to stop abandoned successor");
    }
}

/// Offer every snapshotted connection to the successor, then send done.
///
/// A connection that unregistered after the snapshot is skipped; a failed
/// send loses that one connection to this process. Neither stops the loop.
pub(crate) async fn transfer_connections(
    sender: &ControlSender,
    connections: Vec<RegisteredConnection>,
) -> TransferReport {
    let mut report = TransferReport::default();
    debug!(offered = connections.len(), "Transferring connections");

    for conn in connections {
        let Some(handle) = conn.upgrade() else {
            report.skipped += 1;
            warn!(fd = conn.id, "Connection closed before transfer; skipped");
            continue;
        };
        match sender.send_transfer(handle.as_fd()).await {
            Ok(()) => {
                report.transferred += 1;
                debug!(fd = conn.id, "Sent connection descriptor");
            }
            Err(e) => {
                report.failed += 1;
                warn!(fd = conn.id, error = %e, "Descriptor transfer failed; connection stays behind");
            }
        }
    }

    match sender.send_done().await {
        Ok(()) => report.sentinel_sent = true,
        Err(e) => warn!(error = %e, "Failed to send done sentinel"),
    }
    report
}
