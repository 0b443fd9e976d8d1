//! Connection Handler: the ping/pong liveness protocol.
//!
//! ```text
//! AwaitingRequest → Validating → Replying → AwaitingRequest …
//!        └──────────────┴────────────┴──→ Closed (timeout, bad frame, EOF, I/O error)
//! ```
//!
//! While a restart is in progress the handler does not start reading a new
//! request; it parks until the restart aborts. A parked handler still notices
//! the peer hanging up, without consuming anything, and unregisters. If the
//! restart succeeds this process exits and the successor serves the
//! connection from the first byte the client sends after the hand-off.

use std::fmt;
use std::io;
use std::time::Duration;

use molt_ecdysis::{ConnectionGuard, RestartGate};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Request frame a client sends.
pub const PING: &[u8; 4] = b"ping";
/// Reply frame the server sends.
pub const PONG: &[u8; 4] = b"pong";
/// Size of both frames.
pub const FRAME_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    AwaitingRequest,
    Validating,
    Replying,
    Closed,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::AwaitingRequest => "awaiting_request",
            ProtocolState::Validating => "validating",
            ProtocolState::Replying => "replying",
            ProtocolState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection was closed. Every variant ends that connection only.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no request within {0:?}")]
    ReadTimeout(Duration),

    #[error("reply not written within {0:?}")]
    WriteTimeout(Duration),

    #[error("malformed request {0:?}")]
    Malformed([u8; FRAME_LEN]),

    #[error("peer closed mid-frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Drives one connection until it closes.
///
/// Holds the connection's registry guard, so the connection is unregistered
/// on every exit path.
pub struct ConnectionHandler {
    stream: TcpStream,
    guard: ConnectionGuard,
    gate: RestartGate,
    io_timeout: Duration,
    state: ProtocolState,
    served: u64,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        guard: ConnectionGuard,
        gate: RestartGate,
        io_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            guard,
            gate,
            io_timeout,
            state: ProtocolState::AwaitingRequest,
            served: 0,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Serve requests until the connection ends, then log why.
    pub async fn run(mut self) {
        let result = self.serve().await;
        self.state = ProtocolState::Closed;
        match result {
            Ok(()) => debug!(fd = self.guard.id(), served = self.served, "Peer closed connection"),
            Err(HandlerError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(fd = self.guard.id(), served = self.served, "Connection reset by peer")
            }
            Err(e) => warn!(
                fd = self.guard.id(),
                served = self.served,
                error = %e,
                "Closing connection"
            ),
        }
    }

    /// The request/reply loop. `Ok(())` means the peer closed between frames.
    async fn serve(&mut self) -> Result<(), HandlerError> {
        loop {
            self.state = ProtocolState::AwaitingRequest;
            if self.gate.is_restarting() {
                debug!(fd = self.guard.id(), "Parked during restart");
                tokio::select! {
                    _ = self.gate.wait_idle() => {
                        debug!(fd = self.guard.id(), "Restart aborted; resuming");
                    }
                    _ = peer_hung_up(&self.stream) => return Ok(()),
                }
            }

            // One budget for the whole request, however it trickles in.
            let deadline = Instant::now() + self.io_timeout;

            // Don't take a request off the socket once a restart has begun.
            let ready = tokio::select! {
                biased;
                _ = self.gate.wait_restarting() => continue,
                ready = timeout_at(deadline, self.stream.readable()) => ready,
            };
            ready.map_err(|_| HandlerError::ReadTimeout(self.io_timeout))??;

            let mut request = [0u8; FRAME_LEN];
            let read = timeout_at(deadline, read_frame(&mut self.stream, &mut request))
                .await
                .map_err(|_| HandlerError::ReadTimeout(self.io_timeout))??;
            if read == 0 {
                return Ok(());
            }
            if read < FRAME_LEN {
                return Err(HandlerError::Truncated);
            }

            self.state = ProtocolState::Validating;
            if &request != PING {
                return Err(HandlerError::Malformed(request));
            }

            self.state = ProtocolState::Replying;
            timeout(self.io_timeout, self.stream.write_all(PONG))
                .await
                .map_err(|_| HandlerError::WriteTimeout(self.io_timeout))??;
            self.served += 1;
        }
    }
}

/// Resolve once the peer has closed or reset the connection.
///
/// Only peeks. If a request is already waiting it is left for whoever serves
/// the connection next, and this never resolves.
async fn peer_hung_up(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Fill `buf`, returning fewer bytes only if the peer closed.
async fn read_frame(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_ecdysis::ConnectionRegistry;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct Harness {
        client: TcpStream,
        registry: Arc<ConnectionRegistry>,
        gate: RestartGate,
        task: JoinHandle<()>,
    }

    async fn start(io_timeout: Duration) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let gate = RestartGate::new();
        let guard = registry.register(&server).unwrap();
        let handler = ConnectionHandler::new(server, guard, gate.clone(), io_timeout);
        assert_eq!(handler.state(), ProtocolState::AwaitingRequest);
        let task = tokio::spawn(handler.run());
        Harness {
            client,
            registry,
            gate,
            task,
        }
    }

    async fn ping(client: &mut TcpStream) -> io::Result<[u8; 4]> {
        client.write_all(PING).await?;
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await?;
        Ok(reply)
    }

    async fn finished(task: JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let mut h = start(Duration::from_secs(5)).await;
        for _ in 0..3 {
            assert_eq!(&ping(&mut h.client).await.unwrap(), PONG);
        }
        assert_eq!(h.registry.len(), 1);

        drop(h.client);
        finished(h.task).await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_closes() {
        let mut h = start(Duration::from_secs(5)).await;
        h.client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(h.client.read(&mut buf).await.unwrap(), 0);
        finished(h.task).await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let mut h = start(Duration::from_millis(100)).await;
        let mut buf = [0u8; 4];
        assert_eq!(h.client.read(&mut buf).await.unwrap(), 0);
        finished(h.task).await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_partial_frame_then_close() {
        let mut h = start(Duration::from_secs(5)).await;
        h.client.write_all(b"pi").await.unwrap();
        h.client.shutdown().await.unwrap();
        finished(h.task).await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_slow_request_shares_one_deadline() {
        let io_timeout = Duration::from_millis(300);
        let mut h = start(io_timeout).await;
        let started = std::time::Instant::now();

        // Readiness comes late, then the frame stalls half way.
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.client.write_all(b"pi").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(h.client.read(&mut buf).await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_millis(450));
        finished(h.task).await;
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_parked_handler_notices_peer_close() {
        let h = start(Duration::from_secs(5)).await;
        assert!(h.gate.begin());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.registry.len(), 1);

        drop(h.client);
        finished(h.task).await;
        assert!(h.registry.is_empty());
        // The restart is still in progress.
        assert!(h.gate.is_restarting());
    }

    #[tokio::test]
    async fn test_parks_while_restarting() {
        let mut h = start(Duration::from_millis(200)).await;
        assert_eq!(&ping(&mut h.client).await.unwrap(), PONG);

        assert!(h.gate.begin());
        h.client.write_all(PING).await.unwrap();

        // Parked: no reply, and no idle timeout either.
        let mut reply = [0u8; 4];
        let waited =
            tokio::time::timeout(Duration::from_millis(400), h.client.read_exact(&mut reply)).await;
        assert!(waited.is_err());
        assert!(!h.task.is_finished());
        assert_eq!(h.registry.len(), 1);

        // Abort: the pending request is answered.
        h.gate.abort();
        h.client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, PONG);
    }
}
