//! Client registry
//!
//! Maps connection identifiers to their handles. The registry is owned by
//! the router actor ([`crate::server::ChatServer`]); every operation runs
//! on that one task, so mutations and snapshots never overlap.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::AppError;
use crate::message::{Directory, DirectoryEntry};
use crate::types::ConnectionId;

/// Registered connections: ConnectionId -> Connection
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ConnectionId, Arc<Connection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `id`
    ///
    /// Fails if `id` is already present; the registry is left unchanged.
    pub fn add(&mut self, id: ConnectionId, connection: Arc<Connection>) -> Result<(), AppError> {
        if self.clients.contains_key(&id) {
            return Err(AppError::DuplicateConnection(id));
        }
        self.clients.insert(id, connection);
        Ok(())
    }

    /// Deregister `id`, returning the handle if it was present
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.clients.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Point-in-time copy of every registered handle
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.values().cloned().collect()
    }

    /// Every registered connection with its display name, ordered by id
    pub fn directory(&self) -> Directory {
        let mut entries: Vec<DirectoryEntry> = self
            .clients
            .values()
            .map(|connection| DirectoryEntry {
                id: connection.id(),
                name: connection.display_name(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);
        Directory::new(entries)
    }
}
