//! The set of live connections.
//!
//! Plain data: no locking here. The hub loop is the only owner, so every
//! mutation is already serialized.

use std::collections::HashMap;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. An existing entry with the same id is replaced and
    /// returned (already closed) so the caller can account for it.
    pub fn insert(&mut self, connection: Connection) -> Option<Connection> {
        let previous = self.connections.insert(connection.id(), connection);
        if let Some(old) = &previous {
            old.close();
        }
        previous
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values()
    }
}
