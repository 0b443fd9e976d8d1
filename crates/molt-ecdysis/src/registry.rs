//! Connection Registry.
//!
//! Tracks every live, server-owned connection so a restart can find them.
//! Entries are keyed by the connection's own descriptor number and hold a
//! duplicate of that descriptor: the coordinator sends the duplicate, so it
//! never reaches into a stream a handler is using.
//!
//! ```text
//! Acceptor ──register──┐                 ┌── snapshot ── RestartCoordinator
//! Bootstrap ─register──┼── DashMap<fd> ──┤
//! Handler ──(guard drop)┘                 └── wait_empty ── GracefulShutdown
//! ```

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Identity of a registered connection: its descriptor number in this process.
pub type ConnectionId = RawFd;

/// Registry of live connections.
///
/// Uses DashMap so registration, unregistration and enumeration from many
/// tasks only contend per shard.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<OwnedFd>>,
    emptied: Notify,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            emptied: Notify::new(),
        }
    }

    /// Register a connection for the lifetime of the returned guard.
    ///
    /// Fails only if the descriptor cannot be duplicated.
    pub fn register(self: &Arc<Self>, conn: &impl AsFd) -> io::Result<ConnectionGuard> {
        let id = conn.as_fd().as_raw_fd();
        let handle = Arc::new(conn.as_fd().try_clone_to_owned()?);
        if self.connections.insert(id, Arc::clone(&handle)).is_some() {
            // The descriptor number was reused while a stale entry survived.
            warn!(fd = id, "Replaced stale registry entry");
        }
        debug!(fd = id, connections = self.connections.len(), "Registered connection");
        Ok(ConnectionGuard {
            id,
            handle,
            registry: Arc::clone(self),
        })
    }

    /// Remove a connection by id. Returns whether it was present.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        self.notify_if_empty();
        removed
    }

    fn unregister_handle(&self, id: ConnectionId, handle: &Arc<OwnedFd>) -> bool {
        let removed = self
            .connections
            .remove_if(&id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            debug!(fd = id, connections = self.connections.len(), "Unregistered connection");
        }
        self.notify_if_empty();
        removed
    }

    fn notify_if_empty(&self) {
        if self.connections.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    /// Visit every registered connection.
    ///
    /// The visitor runs while a shard lock is held; it must not register or
    /// unregister. Use [`snapshot`](Self::snapshot) to act on entries.
    pub fn for_each(&self, mut visitor: impl FnMut(ConnectionId, &Arc<OwnedFd>)) {
        for entry in self.connections.iter() {
            visitor(*entry.key(), entry.value());
        }
    }

    /// Weak handles to every connection registered right now.
    ///
    /// A handle stops upgrading once its connection unregisters.
    pub fn snapshot(&self) -> Vec<RegisteredConnection> {
        let mut snapshot = Vec::with_capacity(self.connections.len());
        self.for_each(|id, handle| {
            snapshot.push(RegisteredConnection {
                id,
                handle: Arc::downgrade(handle),
            })
        });
        snapshot
    }

    /// Append connections registered since `snapshot` was taken.
    ///
    /// Existing entries are left alone, so one that closed in the meantime
    /// stays in the snapshot as a handle that no longer upgrades.
    pub fn extend_snapshot(&self, snapshot: &mut Vec<RegisteredConnection>) {
        let known: HashSet<*const OwnedFd> = snapshot.iter().map(|c| c.handle.as_ptr()).collect();
        self.for_each(|id, handle| {
            if !known.contains(&Arc::as_ptr(handle)) {
                snapshot.push(RegisteredConnection {
                    id,
                    handle: Arc::downgrade(handle),
                });
            }
        });
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Resolve once no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a connection registered; unregisters it when dropped.
///
/// Owned by the task driving the connection, so every exit path of that task
/// unregisters.
pub struct ConnectionGuard {
    id: ConnectionId,
    handle: Arc<OwnedFd>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").field("id", &self.id).finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister_handle(self.id, &self.handle);
    }
}

/// A snapshot entry; see [`ConnectionRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct RegisteredConnection {
    pub id: ConnectionId,
    handle: Weak<OwnedFd>,
}

impl RegisteredConnection {
    /// The duplicate descriptor, if the connection is still registered.
    pub fn upgrade(&self) -> Option<Arc<OwnedFd>> {
        self.handle.upgrade()
    }
}
