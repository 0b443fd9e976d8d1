//! Shared helpers for molt-server integration tests.
//!
//! Servers run in-process on a tokio task; a "successor" is another
//! in-process server started by [`TaskSpawner`].

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use molt_ecdysis::{ShutdownSignal, Spawn, Successor};
use molt_server::{Exit, Server, ServerConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ServerTask = JoinHandle<anyhow::Result<Exit>>;

pub fn init_test_env() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,molt_server=debug,molt_ecdysis=debug")
        .with_test_writer()
        .try_init();
}

/// A loopback address with a currently unused port.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn test_config(workspace: &Path, addr: SocketAddr) -> ServerConfig {
    let addr = addr.to_string();
    ServerConfig::from_lookup(workspace, |var| match var {
        "MOLT_LISTEN_ADDR" => Some(addr.clone()),
        "MOLT_CONTROL_TIMEOUT_SECS" => Some("5".into()),
        "MOLT_DRAIN_TIMEOUT_SECS" => Some("2".into()),
        _ => None,
    })
    .unwrap()
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Start a real in-process successor.
    Server,
    /// Fail like a missing executable.
    Fail,
}

/// Starts successors as in-process servers sharing one configuration.
#[derive(Clone)]
pub struct TaskSpawner {
    config: ServerConfig,
    mode: SpawnMode,
    /// How long a successor takes to get going, like a real process start.
    startup_delay: Duration,
    spawned: Arc<AtomicUsize>,
    generations: Arc<Mutex<Vec<Generation>>>,
}

/// A server started by [`TaskSpawner`].
pub struct Generation {
    pub trigger: mpsc::Sender<ShutdownSignal>,
    pub task: ServerTask,
}

pub struct TaskSuccessor {
    task: tokio::task::AbortHandle,
}

impl Successor for TaskSuccessor {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.task.is_finished())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }
}

impl TaskSpawner {
    pub fn new(config: ServerConfig, mode: SpawnMode) -> Self {
        Self {
            config,
            mode,
            startup_delay: Duration::ZERO,
            spawned: Arc::new(AtomicUsize::new(0)),
            generations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// The most recently started successor.
    pub fn take_successor(&self) -> Option<Generation> {
        self.generations.lock().unwrap().pop()
    }
}

impl Spawn for TaskSpawner {
    type Successor = TaskSuccessor;

    fn spawn(&self) -> io::Result<TaskSuccessor> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if self.mode == SpawnMode::Fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such executable"));
        }
        let (trigger, rx) = mpsc::channel(4);
        let server = Server::new(self.config.clone(), self.clone());
        let startup_delay = self.startup_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            server.run(rx).await
        });
        let successor = TaskSuccessor {
            task: task.abort_handle(),
        };
        self.generations
            .lock()
            .unwrap()
            .push(Generation { trigger, task });
        Ok(successor)
    }
}

/// An in-process server in a scratch working directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub workspace: PathBuf,
    pub trigger: mpsc::Sender<ShutdownSignal>,
    pub task: ServerTask,
    pub spawner: TaskSpawner,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(SpawnMode::Server, |dir| dir.to_path_buf()).await
    }

    /// Start with a custom spawn mode and working directory (derived from a
    /// fresh scratch directory).
    pub async fn start_with(mode: SpawnMode, workspace: impl FnOnce(&Path) -> PathBuf) -> Self {
        Self::launch(mode, Duration::ZERO, workspace).await
    }

    /// Start with successors that sit idle for `delay` before bootstrapping,
    /// which leaves room to act while a restart is in progress.
    pub async fn start_with_slow_successor(delay: Duration) -> Self {
        Self::launch(SpawnMode::Server, delay, |dir| dir.to_path_buf()).await
    }

    async fn launch(
        mode: SpawnMode,
        startup_delay: Duration,
        workspace: impl FnOnce(&Path) -> PathBuf,
    ) -> Self {
        init_test_env();
        let dir = tempfile::tempdir().unwrap();
        let workspace = workspace(dir.path());
        let addr = free_addr();
        let config = test_config(&workspace, addr);
        let mut spawner = TaskSpawner::new(config.clone(), mode);
        spawner.startup_delay = startup_delay;

        let (trigger, rx) = mpsc::channel(4);
        let task = tokio::spawn(Server::new(config, spawner.clone()).run(rx));
        wait_listening(addr).await;

        Self {
            addr,
            workspace,
            trigger,
            task,
            spawner,
            _dir: dir,
        }
    }

    pub async fn signal(&self, signal: ShutdownSignal) {
        self.trigger.send(signal).await.unwrap();
    }
}

/// Wait until something accepts on `addr`.
///
/// Probes with a connection that is closed right away, so it is gone from
/// the server's registry shortly after.
pub async fn wait_listening(addr: SocketAddr) {
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server at {addr} never started listening");
}

/// Wait for a server task to finish and return how it ended.
pub async fn exit_of(task: ServerTask) -> Exit {
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("server did not exit in time")
        .expect("server task panicked")
        .expect("server failed")
}
