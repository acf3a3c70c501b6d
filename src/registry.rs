//! Thread-safe registry of live connections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::Connection;

/// Ordered collection of live connections behind one coarse lock.
///
/// The backing collection is never exposed: mutation goes through
/// [`add`](Self::add)/[`remove`](Self::remove), iteration through
/// [`snapshot`](Self::snapshot). The lock is held only for the duration of
/// the mutation or copy, never across blocking I/O.
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
}

fn lock(mutex: &Mutex<Vec<Arc<Connection>>>) -> MutexGuard<'_, Vec<Arc<Connection>>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Append a connection.
    pub fn add(&self, connection: Arc<Connection>) {
        lock(&self.connections).push(connection);
    }

    /// Look up a connection by id.
    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Remove a connection by id, returning it if it was registered.
    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let mut connections = lock(&self.connections);
        let index = connections.iter().position(|c| c.id() == id)?;
        Some(connections.remove(index))
    }

    /// Stable snapshot for iteration, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections).clone()
    }

    /// Take every registered connection, leaving the registry empty.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *lock(&self.connections))
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
