//! Launching the next process generation.
//!
//! The successor is the same program with the same arguments and environment,
//! inheriting only stdin/stdout/stderr. Sockets are never inherited at spawn
//! time (Rust and tokio open everything close-on-exec); live connections are
//! pushed over the control channel afterwards instead.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

/// A running successor process, as far as the coordinator cares.
pub trait Successor: Send {
    /// Process id, if known.
    fn id(&self) -> Option<u32>;

    /// Whether the successor has already exited.
    fn has_exited(&mut self) -> io::Result<bool>;

    /// Ask the successor to die (used when a restart is abandoned).
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts successors.
pub trait Spawn: Send + Sync {
    type Successor: Successor;

    fn spawn(&self) -> io::Result<Self::Successor>;
}

/// Re-executes the current program.
///
/// Uses `argv[0]` when present so that a binary replaced on disk at the same
/// path is what starts; falls back to the running executable's path.
#[derive(Debug, Clone, Default)]
pub struct CurrentExe;

impl CurrentExe {
    fn program_and_args() -> io::Result<(PathBuf, Vec<OsString>)> {
        let mut args = std::env::args_os();
        let program = match args.next() {
            Some(argv0) if !argv0.is_empty() => PathBuf::from(argv0),
            _ => std::env::current_exe()?,
        };
        Ok((program, args.collect()))
    }
}

impl Spawn for CurrentExe {
    type Successor = Child;

    fn spawn(&self) -> io::Result<Child> {
        let (program, args) = Self::program_and_args()?;
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        info!(
            program = %program.display(),
            args = ?args,
            parent_pid = std::process::id(),
            successor_pid = ?child.id(),
            "Spawned successor process"
        );
        Ok(child)
    }
}

impl Successor for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.start_kill()
    }
}
