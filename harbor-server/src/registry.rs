//! Connection registry
//!
//! The authoritative set of live connections, keyed by connection id. The
//! server holds the only strong references; everything handed outward is a
//! weak [`ConnectionHandle`]. Membership is the liveness test: a connection
//! is reachable exactly as long as it is registered, and it is removed the
//! moment it reports closure.

use crate::connection::{Connection, ConnectionHandle};
use harbor_core::ConnectionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Id-keyed set of live connections.
///
/// Critical sections are short and never held across an await, so a plain
/// mutex serializes the loop's inserts against reaping and `close()`.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Mutex<Connection>>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next connection id. Ids are never reused.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a connection and return the weak handle for the application.
    pub fn insert(&self, id: ConnectionId, conn: Arc<Mutex<Connection>>) -> ConnectionHandle {
        let handle = ConnectionHandle::new(id, Arc::downgrade(&conn));
        self.connections.lock().unwrap().insert(id, conn);
        handle
    }

    /// Remove a connection. Idempotent: removing an unknown id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().unwrap().remove(&id)
    }

    /// Look up a connection by id, returning a weak handle.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .lock()
            .unwrap()
            .get(&id)
            .map(|conn| ConnectionHandle::new(id, Arc::downgrade(conn)))
    }

    /// Whether the id is currently registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().unwrap().contains_key(&id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().unwrap().keys().copied().collect()
    }

    /// Drop every connection. Their I/O tasks observe the closed outbound
    /// queues and shut down.
    pub fn clear(&self) {
        self.connections.lock().unwrap().clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
