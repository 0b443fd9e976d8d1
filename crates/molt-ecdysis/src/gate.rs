//! The "restart in progress" flag.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared restart flag read by the acceptor and the handlers, written by the
/// restart coordinator.
///
/// Waiters park on a watch channel instead of polling.
#[derive(Debug, Clone)]
pub struct RestartGate {
    restarting: Arc<watch::Sender<bool>>,
}

impl Default for RestartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartGate {
    pub fn new() -> Self {
        let (restarting, _) = watch::channel(false);
        Self {
            restarting: Arc::new(restarting),
        }
    }

    /// Mark a restart as started. Returns `false` if one already is.
    pub fn begin(&self) -> bool {
        self.restarting.send_if_modified(|restarting| {
            if *restarting {
                false
            } else {
                *restarting = true;
                true
            }
        })
    }

    /// Clear the flag after an aborted restart.
    pub fn abort(&self) {
        self.restarting.send_replace(false);
    }

    pub fn is_restarting(&self) -> bool {
        *self.restarting.borrow()
    }

    /// Resolve once no restart is in progress.
    pub async fn wait_idle(&self) {
        let mut rx = self.restarting.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|restarting| !*restarting).await;
    }

    /// Resolve once a restart starts.
    pub async fn wait_restarting(&self) {
        let mut rx = self.restarting.subscribe();
        let _ = rx.wait_for(|restarting| *restarting).await;
    }
}
