//! Hand-off bootstrap, run once by a new process before it starts accepting.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::control::{ControlFrame, ControlReceiver};

/// What the bootstrap received from a predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffReport {
    /// Descriptors handed to the adopt callback successfully.
    pub adopted: usize,
    /// Frames (or adoptions) rejected; each costs at most one connection.
    pub rejected: usize,
    /// Whether the done sentinel arrived.
    pub completed: bool,
}

/// Outcome of [`receive_connections`].
#[derive(Debug)]
pub enum Bootstrap {
    /// No predecessor is restarting.
    ColdStart,
    /// Connections were inherited; the predecessor waits on [`Inheritance::release`].
    Inherited(Inheritance),
}

/// The still-open control channel after a hand-off.
///
/// The predecessor treats the channel closing as "the successor is
/// listening", so release it only once the listening endpoint is bound.
/// Dropping it has the same effect.
#[derive(Debug)]
pub struct Inheritance {
    channel: ControlReceiver,
    report: HandoffReport,
}

impl Inheritance {
    pub fn report(&self) -> &HandoffReport {
        &self.report
    }

    /// Close the control channel, confirming the listener to the predecessor.
    pub fn release(self) -> HandoffReport {
        drop(self.channel);
        debug!("Released control channel");
        self.report
    }
}

/// Connect to a predecessor's control channel at `path` and adopt every
/// connection it sends, until the done sentinel.
///
/// `adopt` takes ownership of each received descriptor; it should register
/// the connection and start a handler for it. A rejected frame or a failed
/// adoption is logged and the loop moves on to the next frame.
pub async fn receive_connections<F>(path: &Path, deadline: Duration, mut adopt: F) -> Bootstrap
where
    F: FnMut(OwnedFd) -> io::Result<()>,
{
    let channel = match ControlReceiver::connect(path, deadline).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            info!(path = %path.display(), "No predecessor; cold start");
            return Bootstrap::ColdStart;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Control channel unreachable; cold start");
            return Bootstrap::ColdStart;
        }
    };
    info!(path = %path.display(), "Connected to predecessor; receiving connections");

    let mut report = HandoffReport::default();
    loop {
        match channel.next_frame().await {
            Ok(Ok(ControlFrame::Transfer(fd))) => match adopt(fd) {
                Ok(()) => report.adopted += 1,
                Err(e) => {
                    report.rejected += 1;
                    warn!(error = %e, "Failed to adopt transferred connection");
                }
            },
            Ok(Ok(ControlFrame::Done)) => {
                report.completed = true;
                break;
            }
            Ok(Err(e)) => {
                report.rejected += 1;
                warn!(error = %e, "Rejected malformed control frame");
            }
            Err(e) => {
                warn!(error = %e, "Control channel failed before the done frame");
                break;
            }
        }
    }

    info!(
        adopted = report.adopted,
        rejected = report.rejected,
        completed = report.completed,
        "Hand-off received"
    );
    Bootstrap::Inherited(Inheritance { channel, report })
}
