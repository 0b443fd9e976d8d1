//! Control channel for the connection hand-off.
//!
//! A filesystem-addressed Unix stream socket, used once per restart. The old
//! process listens, the new process connects. Messages flow old → new and are
//! one byte each:
//!
//! | tag    | ancillary data          | meaning                       |
//! |--------|-------------------------|-------------------------------|
//! | `0x00` | exactly one descriptor  | transfer this connection      |
//! | `0x01` | none                    | done, no more transfers       |
//!
//! Zero or more transfers are followed by exactly one done. The new process
//! closes its end only after its own listener is open, so the old process
//! reads end-of-stream as "the successor is accepting".

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::fdpass;

/// Tag of a transfer message.
pub const TAG_TRANSFER: u8 = 0x00;
/// Tag of the end-of-transfer sentinel.
pub const TAG_DONE: u8 = 0x01;
/// File name of the control socket inside the working directory.
pub const CONTROL_SOCKET_NAME: &str = "conn.sock";

/// A decoded control message.
#[derive(Debug)]
pub enum ControlFrame {
    /// A live connection handed over by the predecessor.
    Transfer(OwnedFd),
    /// End of the transfer sequence.
    Done,
}

/// Reasons a single control message is rejected.
///
/// Any descriptors that came with a rejected message are closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown control tag {0:#04x}")]
    UnknownTag(u8),

    #[error("transfer frame carried {0} descriptors, expected exactly one")]
    DescriptorCount(usize),

    #[error("ancillary data was truncated")]
    Truncated,
}

impl ControlFrame {
    /// Decode one message from its tag byte and the descriptors that came with it.
    pub fn decode(tag: u8, mut fds: Vec<OwnedFd>, truncated: bool) -> Result<Self, FrameError> {
        if truncated {
            return Err(FrameError::Truncated);
        }
        match tag {
            TAG_TRANSFER if fds.len() == 1 => Ok(Self::Transfer(fds.remove(0))),
            TAG_TRANSFER => Err(FrameError::DescriptorCount(fds.len())),
            TAG_DONE => {
                if !fds.is_empty() {
                    warn!(count = fds.len(), "Done frame carried stray descriptors; closing them");
                }
                Ok(Self::Done)
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

fn timed_out(what: &str, deadline: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{what} did not complete within {deadline:?}"),
    )
}

/// The old process's end before the successor connects.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind a fresh control socket at `path`, replacing any stale one.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "Control socket bound");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the single peer this channel exists for.
    pub async fn accept_peer(&self, deadline: Duration) -> io::Result<ControlSender> {
        let (stream, _) = timeout(deadline, self.listener.accept())
            .await
            .map_err(|_| timed_out("control peer connect", deadline))??;
        debug!(path = %self.path.display(), "Control peer connected");
        Ok(ControlSender { stream, deadline })
    }

    /// Close the socket and unlink its path.
    pub fn destroy(self) {
        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// The old process's end once the successor is connected.
#[derive(Debug)]
pub struct ControlSender {
    stream: UnixStream,
    deadline: Duration,
}

impl ControlSender {
    /// Hand one connection descriptor to the successor.
    pub async fn send_transfer(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.send_frame(TAG_TRANSFER, Some(fd)).await
    }

    /// Send the end-of-transfer sentinel.
    pub async fn send_done(&self) -> io::Result<()> {
        self.send_frame(TAG_DONE, None).await
    }

    pub(crate) async fn send_frame(&self, tag: u8, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        let written = timeout(
            self.deadline,
            fdpass::send_descriptor(&self.stream, &[tag], fd),
        )
        .await
        .map_err(|_| timed_out("control send", self.deadline))??;
        if written != 1 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        Ok(())
    }

    /// Wait for the successor to close its end of the channel.
    pub async fn wait_peer_closed(&mut self) -> io::Result<()> {
        let deadline = self.deadline;
        timeout(deadline, async {
            let mut buf = [0u8; 16];
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) => return Ok(()),
                    Ok(n) => warn!(bytes = n, "Ignoring unexpected bytes from control peer"),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| timed_out("successor listener confirmation", deadline))?
    }
}

/// The new process's end of the channel.
#[derive(Debug)]
pub struct ControlReceiver {
    stream: UnixStream,
    deadline: Duration,
}

impl ControlReceiver {
    /// Connect to a predecessor's control socket.
    ///
    /// `Ok(None)` means nobody is restarting: the path is missing or nothing
    /// listens on it.
    pub async fn connect(path: &Path, deadline: Duration) -> io::Result<Option<Self>> {
        match timeout(deadline, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => Ok(Some(Self { stream, deadline })),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out("control connect", deadline)),
        }
    }

    /// Read the next message.
    ///
    /// The outer error ends the channel (I/O failure, deadline, or the peer
    /// closing before the sentinel); the inner one rejects a single frame.
    pub async fn next_frame(&self) -> io::Result<Result<ControlFrame, FrameError>> {
        let mut tag = [0u8; 1];
        let msg = timeout(self.deadline, fdpass::recv_descriptor(&self.stream, &mut tag))
            .await
            .map_err(|_| timed_out("control receive", self.deadline))??;
        if msg.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control channel closed before the done frame",
            ));
        }
        Ok(ControlFrame::decode(tag[0], msg.fds, msg.truncated))
    }
}
