//! # molt-ecdysis
//!
//! Self-restart with zero connection loss, in the spirit of the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/),
//! except that live *connections* move between process generations, not just
//! listening sockets.
//!
//! ## Overview
//!
//! A restart runs in the old process as a small state machine:
//! 1. Bind a one-shot control socket (`<workdir>/conn.sock`) and pause accepting
//! 2. Spawn the same executable with the same arguments and environment
//! 3. Wait for the new process to connect to the control socket
//! 4. Push every connection registered when the restart began, plus any
//!    swept off the paused listener's backlog, across it (`SCM_RIGHTS`),
//!    then a one-byte sentinel
//! 5. Wait until the new process has opened its own listener, then retire
//!
//! The new process runs the hand-off bootstrap before opening its listener:
//! it connects to the control socket, adopts each descriptor it receives and
//! stops at the sentinel. With no predecessor it simply cold-starts.
//!
//! ## Signal Conventions
//!
//! - `SIGUSR2`: Restart (hand connections to a fresh process, then exit)
//! - `SIGTERM` / `SIGINT`: Graceful stop (stop accepting, drain, exit)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

pub mod control;
pub mod fdpass;
mod gate;
pub mod handoff;
mod registry;
mod restart;
mod shutdown;
mod spawn;

pub use control::{ControlFrame, ControlListener, ControlReceiver, ControlSender, FrameError};
pub use gate::RestartGate;
pub use handoff::{receive_connections, Bootstrap, HandoffReport, Inheritance};
pub use registry::{ConnectionGuard, ConnectionId, ConnectionRegistry, RegisteredConnection};
pub use restart::{
    RestartConfig, RestartCoordinator, RestartError, RestartReport, RestartState, TransferReport,
};
pub use shutdown::{GracefulShutdown, ShutdownSignal, SignalListener};
pub use spawn::{CurrentExe, Spawn, Successor};
