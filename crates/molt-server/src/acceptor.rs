//! Acceptor and the dispatch path shared with the hand-off bootstrap.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use molt_ecdysis::fdpass::is_socket;
use molt_ecdysis::{ConnectionRegistry, RestartGate};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::handler::ConnectionHandler;

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Where a dispatched connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted on this process's listener.
    Accepted,
    /// Handed over by the predecessor.
    Inherited,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Accepted => "accepted",
            Origin::Inherited => "inherited",
        })
    }
}

/// Registers a connection and starts its handler task.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    gate: RestartGate,
    io_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, gate: RestartGate, io_timeout: Duration) -> Self {
        Self {
            registry,
            gate,
            io_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register `stream` and serve it on its own task.
    pub fn dispatch(&self, stream: TcpStream, origin: Origin) -> io::Result<()> {
        let guard = self.registry.register(&stream)?;
        let fd = guard.id();
        let peer = stream.peer_addr().ok();
        debug!(fd, peer = ?peer, %origin, "Dispatching connection");

        let handler = ConnectionHandler::new(stream, guard, self.gate.clone(), self.io_timeout);
        tokio::spawn(handler.run().instrument(info_span!(
            "molt.connection",
            fd,
            peer = ?peer,
            origin = %origin,
        )));
        Ok(())
    }

    /// Take over a descriptor received from the predecessor.
    pub fn adopt(&self, fd: OwnedFd) -> io::Result<()> {
        if !is_socket(fd.as_fd()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "transferred descriptor is not a socket",
            ));
        }
        let stream = std::net::TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        self.dispatch(TcpStream::from_std(stream)?, Origin::Inherited)
    }
}

/// Open the listening endpoint.
///
/// `SO_REUSEPORT` lets a successor bind the same address while this process
/// still holds its own listener.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Asks a paused [`Acceptor`] to take what is queued on its listener.
#[derive(Debug, Clone)]
pub struct BacklogSweeper {
    requests: mpsc::Sender<oneshot::Sender<usize>>,
}

impl BacklogSweeper {
    /// Returns how many queued connections were dispatched; 0 once the
    /// accept loop has stopped.
    pub async fn sweep(&self) -> usize {
        let (reply, swept) = oneshot::channel();
        if self.requests.send(reply).await.is_err() {
            return 0;
        }
        swept.await.unwrap_or(0)
    }
}

/// The accept loop.
///
/// Stops calling `accept` while a restart is in progress (the listener stays
/// open) and resumes if the restart aborts. While paused it only accepts on a
/// [`BacklogSweeper`] request. Returns, dropping the listener, once the stop
/// token fires.
pub struct Acceptor {
    listener: TcpListener,
    dispatcher: Dispatcher,
    gate: RestartGate,
    stop: CancellationToken,
    sweeper: BacklogSweeper,
    sweeps: mpsc::Receiver<oneshot::Sender<usize>>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        dispatcher: Dispatcher,
        gate: RestartGate,
        stop: CancellationToken,
    ) -> Self {
        let (requests, sweeps) = mpsc::channel(1);
        Self {
            listener,
            dispatcher,
            gate,
            stop,
            sweeper: BacklogSweeper { requests },
            sweeps,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sweeper(&self) -> BacklogSweeper {
        self.sweeper.clone()
    }

    pub async fn run(mut self) {
        loop {
            if self.gate.is_restarting() {
                debug!("Accepting paused for restart");
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = self.gate.wait_idle() => {
                        info!("Restart aborted; accepting again");
                        continue;
                    }
                    Some(reply) = self.sweeps.recv() => {
                        let _ = reply.send(self.sweep_backlog());
                        continue;
                    }
                }
            }

            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.gate.wait_restarting() => continue,
                Some(reply) = self.sweeps.recv() => {
                    let _ = reply.send(self.sweep_backlog());
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.dispatcher.dispatch(stream, Origin::Accepted) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        info!("Accept loop stopped; closing listener");
    }

    /// Dispatch every connection already queued on the listener, without
    /// waiting for more.
    fn sweep_backlog(&self) -> usize {
        let listener = SockRef::from(&self.listener);
        let mut swept = 0;
        loop {
            let (socket, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept queued connection");
                    break;
                }
            };
            match self.dispatch_queued(socket) {
                Ok(()) => swept += 1,
                Err(e) => warn!(
                    peer = ?peer.as_socket(),
                    error = %e,
                    "Failed to register queued connection"
                ),
            }
        }
        debug!(swept, "Swept listener backlog");
        swept
    }

    fn dispatch_queued(&self, socket: Socket) -> io::Result<()> {
        let stream = std::net::TcpStream::from(socket);
        stream.set_nonblocking(true)?;
        self.dispatcher.dispatch(TcpStream::from_std(stream)?, Origin::Accepted)
    }
}
