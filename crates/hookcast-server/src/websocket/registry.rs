//! Live set of connections eligible for broadcast.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::connection::{ClientConnection, ConnectionId};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_DISCONNECTIONS_TOTAL};

/// Connections indexed by ID.
///
/// The lock is never held across an `.await`; readers take a
/// [`snapshot`](Self::snapshot) and iterate it unlocked.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    /// Mirrors `connections.len()`, updated under the write lock.
    active_count: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Add a connection. A second registration of the same ID is ignored.
    ///
    /// Returns `true` if the connection was inserted.
    pub fn register(&self, connection: Arc<ClientConnection>) -> bool {
        let mut conns = self.connections.write();
        match conns.entry(connection.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(connection);
                let active = conns.len();
                self.active_count.store(active, Ordering::Relaxed);
                gauge!(WS_CONNECTIONS_ACTIVE).set(active as f64);
                true
            }
        }
    }

    /// Remove a connection by ID. Removing an absent ID is a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let (removed, active) = {
            let mut conns = self.connections.write();
            let removed = conns.remove(id);
            self.active_count.store(conns.len(), Ordering::Relaxed);
            (removed, conns.len())
        };
        if removed.is_some() {
            gauge!(WS_CONNECTIONS_ACTIVE).set(active as f64);
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            debug!(conn_id = %id, active, "connection unregistered");
        }
        removed
    }

    /// Point-in-time copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Look up a registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the registry and ask every drained connection to close.
    ///
    /// Returns how many connections were drained.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<ClientConnection>> = {
            let mut conns = self.connections.write();
            self.active_count.store(0, Ordering::Relaxed);
            conns.drain().map(|(_, conn)| conn).collect()
        };
        gauge!(WS_CONNECTIONS_ACTIVE).set(0.0);
        counter!(WS_DISCONNECTIONS_TOTAL).increment(drained.len() as u64);
        for conn in &drained {
            let _ = conn.begin_close();
        }
        drained.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection registered for as long as the guard lives.
///
/// Dropping the guard unregisters the connection and marks it `Closed`,
/// so every exit path of the socket task runs the cleanup exactly once.
/// A connection-limit slot attached with [`with_slot`](Self::with_slot) is
/// released after the connection leaves the registry.
pub struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    connection: Arc<ClientConnection>,
    slot: Option<OwnedSemaphorePermit>,
}

impl RegistrationGuard {
    /// Register `connection` and return the guard that will remove it.
    ///
    /// Returns `None` if a connection with the same ID is already registered.
    pub fn register(
        registry: Arc<ConnectionRegistry>,
        connection: Arc<ClientConnection>,
    ) -> Option<Self> {
        if !registry.register(Arc::clone(&connection)) {
            return None;
        }
        Some(Self {
            registry,
            connection,
            slot: None,
        })
    }

    /// Hold `permit` until the guard is dropped.
    #[must_use]
    pub fn with_slot(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self.slot = permit;
        self
    }

    /// The guarded connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let _ = self.registry.unregister(&self.connection.id);
        self.connection.mark_closed();
        drop(self.slot.take());
    }
}
