//! Connection id → connection entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use streamhub_core::{ConnectionId, RegistryError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::{ConnectionState, Metadata, Transport};

/// A registered connection and the topics it is subscribed to.
///
/// `topics` mirrors the [`super::topics::TopicRegistry`]; the manager keeps
/// both sides in step under one lock.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Shared connection state.
    pub state: Arc<ConnectionState>,
    /// Topics this connection is subscribed to.
    pub topics: BTreeSet<String>,
}

/// Owns every live connection.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnectionId, ConnectionEntry>,
    parent: CancellationToken,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_parent(CancellationToken::new())
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose connection tokens are children of `parent`.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            entries: HashMap::new(),
            parent,
        }
    }

    /// Register a connection with a fresh heartbeat and an empty topic set.
    pub fn register(
        &mut self,
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        metadata: Metadata,
    ) -> Result<Arc<ConnectionState>, RegistryError> {
        if self.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }
        let state = Arc::new(ConnectionState::new(
            id.clone(),
            transport,
            metadata,
            self.parent.child_token(),
        ));
        let _ = self.entries.insert(
            id,
            ConnectionEntry {
                state: Arc::clone(&state),
                topics: BTreeSet::new(),
            },
        );
        Ok(state)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(id)
    }

    /// Look up a connection mutably.
    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(id)
    }

    /// Refresh the heartbeat of a registered connection.
    ///
    /// Unknown ids are a no-op and never recreate an entry.
    pub fn touch_heartbeat(&self, id: &ConnectionId) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.state.touch();
                true
            }
            None => {
                debug!(conn_id = %id, "heartbeat for unknown connection");
                false
            }
        }
    }

    /// Remove a connection. Returns the removed entry, if any.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.remove(id)
    }

    /// Ids whose last heartbeat is older than `timeout` as of `now`.
    pub fn list_stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state.is_stale(now, timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered ids.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().cloned().collect()
    }

    /// Iterate over every entry.
    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::ChannelTransport;

    fn transport() -> Arc<dyn Transport> {
        let (transport, _rx) = ChannelTransport::new(4);
        Arc::new(transport)
    }

    #[test]
    fn register_and_get() {
        let mut registry = ConnectionRegistry::new();
        let id = ConnectionId::from("conn_a");
        let state = registry
            .register(id.clone(), transport(), Metadata::new())
            .unwrap();
        assert_eq!(state.id, id);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).unwrap().topics.is_empty());
    }

    #[test]
    fn duplicate_register_rejected() {
        let mut registry = ConnectionRegistry::new();
        let id = ConnectionId::from("conn_a");
        let _ = registry
            .register(id.clone(), transport(), Metadata::new())
            .unwrap();
        let err = registry
            .register(id.clone(), transport(), Metadata::new())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateConnection(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_unknown_does_not_create() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.touch_heartbeat(&ConnectionId::from("ghost")));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_returns_entry_once() {
        let mut registry = ConnectionRegistry::new();
        let id = ConnectionId::from("conn_a");
        let _ = registry
            .register(id.clone(), transport(), Metadata::new())
            .unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn tokens_are_children_of_parent() {
        let parent = CancellationToken::new();
        let mut registry = ConnectionRegistry::with_parent(parent.clone());
        let state = registry
            .register(ConnectionId::from("conn_a"), transport(), Metadata::new())
            .unwrap();
        parent.cancel();
        assert!(state.closed_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn list_stale_only_returns_expired() {
        let mut registry = ConnectionRegistry::new();
        let old = ConnectionId::from("old");
        let fresh = ConnectionId::from("fresh");
        let _ = registry
            .register(old.clone(), transport(), Metadata::new())
            .unwrap();
        let _ = registry
            .register(fresh.clone(), transport(), Metadata::new())
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.touch_heartbeat(&fresh));

        let stale = registry.list_stale(Instant::now(), Duration::from_secs(60));
        assert_eq!(stale, vec![old]);
    }
}
