//! # molt-server
//!
//! A TCP ping/pong service that restarts on `SIGUSR2` without dropping a
//! single established connection. The restart machinery lives in
//! `molt-ecdysis`; this crate supplies the application around it:
//!
//! - [`handler`]: the per-connection `ping` → `pong` loop
//! - [`acceptor`]: the accept loop and the dispatch path shared with
//!   connections inherited from a predecessor
//! - [`server`]: process lifecycle wiring
//! - [`probe`]: the probing client behind `molt-probe`

pub mod acceptor;
pub mod config;
pub mod handler;
pub mod probe;
pub mod server;
pub mod telemetry;

pub use config::{Args, ServerConfig};
pub use server::{run_with_signals, Exit, Server};
