//! Connection registry: `user_id → live connections`
//!
//! Plain data structure owned by the dispatcher actor. A user with no
//! connections has no entry.

use serde::Serialize;
use std::collections::HashMap;

/// Identifier of one live client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry size snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub users: usize,
    pub connections: usize,
}

/// Map from user id to that user's connections, each carrying a `T`
#[derive(Debug)]
pub struct Registry<T> {
    users: HashMap<String, HashMap<ConnectionId, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns false (and keeps the existing value) if
    /// it was already registered for this user.
    pub fn register(&mut self, user_id: &str, id: ConnectionId, value: T) -> bool {
        let connections = self.users.entry(user_id.to_string()).or_default();
        if connections.contains_key(&id) {
            return false;
        }
        connections.insert(id, value);
        true
    }

    /// Remove a connection, dropping the user's entry once it is empty.
    /// Unknown pairs are ignored.
    pub fn deregister(&mut self, user_id: &str, id: ConnectionId) -> Option<T> {
        let connections = self.users.get_mut(user_id)?;
        let removed = connections.remove(&id);
        if connections.is_empty() {
            self.users.remove(user_id);
        }
        removed
    }

    pub fn connections(&self, user_id: &str) -> Option<&HashMap<ConnectionId, T>> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &str, id: ConnectionId) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|connections| connections.contains_key(&id))
    }

    /// Connection ids of a user, sorted; `None` when the user has no entry
    pub fn connection_ids(&self, user_id: &str) -> Option<Vec<ConnectionId>> {
        self.users.get(user_id).map(|connections| {
            let mut ids: Vec<ConnectionId> = connections.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            users: self.users.len(),
            connections: self.users.values().map(HashMap::len).sum(),
        }
    }

    /// Remove everything, returning the connection values
    pub fn drain(&mut self) -> Vec<T> {
        self.users
            .drain()
            .flat_map(|(_, connections)| connections.into_values())
            .collect()
    }
}
