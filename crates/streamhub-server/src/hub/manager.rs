//! The connection manager: sole owner and mutator of the topic and
//! connection registries.
//!
//! Both registries live behind one lock so that composite operations
//! (register, subscribe, disconnect) are atomic with respect to each other.
//! Broadcast holds the lock only long enough to snapshot its recipients;
//! transport sends happen outside it.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use streamhub_core::{ConnectionId, RegistryError, ServerMessage, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionState, Metadata, Transport};
use super::registry::ConnectionRegistry;
use super::topics::TopicRegistry;
use crate::metrics::{
    HUB_BROADCASTS_TOTAL, HUB_CONNECTIONS_ACTIVE, HUB_CONNECTIONS_TOTAL,
    HUB_DELIVERY_FAILURES_TOTAL, HUB_DISCONNECTIONS_TOTAL, HUB_EVICTIONS_TOTAL,
    HUB_MESSAGES_DROPPED_TOTAL,
};

/// Total full-queue drops after which a connection is treated as dead.
pub const MAX_TOTAL_DROPS: u64 = 100;

/// Outcome of one [`ConnectionManager::broadcast`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the frame was queued for.
    pub delivered: usize,
    /// Subscribers whose queue was full; the frame was skipped for them.
    pub dropped: usize,
    /// Subscribers that failed and were disconnected.
    pub disconnected: Vec<ConnectionId>,
}

impl BroadcastReport {
    /// Number of subscribers that were attempted.
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.disconnected.len()
    }
}

enum Delivery {
    Delivered,
    Dropped,
    Failed,
}

struct Registries {
    topics: TopicRegistry,
    connections: ConnectionRegistry,
}

/// Tracks every live connection and its topic subscriptions.
pub struct ConnectionManager {
    inner: RwLock<Registries>,
    max_connections: usize,
    root: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager accepting at most `max_connections` connections.
    pub fn new(max_connections: usize) -> Self {
        let root = CancellationToken::new();
        Self {
            inner: RwLock::new(Registries {
                topics: TopicRegistry::new(),
                connections: ConnectionRegistry::with_parent(root.clone()),
            }),
            max_connections,
            root,
        }
    }

    /// Register a new connection under a freshly generated id.
    pub fn connect(
        &self,
        transport: Arc<dyn Transport>,
        metadata: Metadata,
    ) -> Result<ConnectionId, RegistryError> {
        let id = ConnectionId::new();
        let active = {
            let mut inner = self.inner.write();
            if inner.connections.len() >= self.max_connections {
                warn!(limit = self.max_connections, "connection limit reached");
                return Err(RegistryError::CapacityExceeded {
                    limit: self.max_connections,
                });
            }
            let _ = inner
                .connections
                .register(id.clone(), transport, metadata)?;
            inner.connections.len()
        };
        counter!(HUB_CONNECTIONS_TOTAL).increment(1);
        gauge!(HUB_CONNECTIONS_ACTIVE).set(active as f64);
        info!(conn_id = %id, active, "connection registered");
        Ok(id)
    }

    /// Subscribe a registered connection to `topic`.
    ///
    /// Returns `Ok(false)` if it was already subscribed.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(id) else {
            return Err(RegistryError::UnknownConnection(id.clone()));
        };
        let added = entry.topics.insert(topic.to_owned());
        let _ = inner.topics.subscribe(id, topic);
        if added {
            debug!(conn_id = %id, topic, "subscribed");
        }
        Ok(added)
    }

    /// Unsubscribe a registered connection from `topic`.
    ///
    /// Returns `Ok(false)` if it was not subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(entry) = inner.connections.get_mut(id) else {
            return Err(RegistryError::UnknownConnection(id.clone()));
        };
        let removed = entry.topics.remove(topic);
        let _ = inner.topics.unsubscribe(id, topic);
        if removed {
            debug!(conn_id = %id, topic, "unsubscribed");
        }
        Ok(removed)
    }

    /// Serialize `message` once and queue it for every subscriber of `topic`.
    ///
    /// Subscribers whose transport fails are disconnected; the rest still
    /// receive the frame. A topic with no subscribers is a no-op.
    pub fn broadcast(&self, topic: &str, message: &ServerMessage) -> BroadcastReport {
        let targets: Vec<Arc<ConnectionState>> = {
            let inner = self.inner.read();
            inner
                .topics
                .subscribers_of(topic)
                .iter()
                .filter_map(|id| inner.connections.get(id))
                .map(|entry| Arc::clone(&entry.state))
                .collect()
        };

        let mut report = BroadcastReport::default();
        if targets.is_empty() {
            trace!(topic, "broadcast skipped, no subscribers");
            return report;
        }

        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(topic, kind = message.kind(), error = %e, "failed to serialize message");
                return report;
            }
        };

        for conn in &targets {
            match Self::deliver(conn, &frame) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Failed => report.disconnected.push(conn.id.clone()),
            }
        }
        for id in &report.disconnected {
            let _ = self.disconnect(id);
        }

        counter!(HUB_BROADCASTS_TOTAL, "topic" => topic.to_owned()).increment(1);
        debug!(
            topic,
            kind = message.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            disconnected = report.disconnected.len(),
            "broadcast"
        );
        report
    }

    /// Queue `message` for a single connection.
    ///
    /// Returns `false` if the connection is unknown or the frame was not
    /// queued. A failed transport disconnects the connection.
    pub fn send_to_one(&self, id: &ConnectionId, message: &ServerMessage) -> bool {
        let Some(conn) = self.connection(id) else {
            debug!(conn_id = %id, kind = message.kind(), "send to unknown connection");
            return false;
        };
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(conn_id = %id, kind = message.kind(), error = %e, "failed to serialize message");
                return false;
            }
        };
        match Self::deliver(&conn, &frame) {
            Delivery::Delivered => true,
            Delivery::Dropped => false,
            Delivery::Failed => {
                let _ = self.disconnect(id);
                false
            }
        }
    }

    /// Refresh the heartbeat of a connection without replying.
    pub fn touch_heartbeat(&self, id: &ConnectionId) -> bool {
        self.inner.read().connections.touch_heartbeat(id)
    }

    /// Handle a client ping: refresh the heartbeat and reply with a pong.
    ///
    /// Unknown ids are ignored.
    pub fn handle_heartbeat(&self, id: &ConnectionId) -> bool {
        if !self.touch_heartbeat(id) {
            return false;
        }
        let _ = self.send_to_one(id, &ServerMessage::pong());
        true
    }

    /// Remove a connection from every topic and from the registry, then
    /// release its transport.
    ///
    /// Idempotent: concurrent or repeated calls for the same id release it
    /// exactly once. Returns `true` for the call that removed it.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        self.remove_if(id, |_| true)
    }

    /// Evict every connection whose heartbeat is older than `timeout`.
    ///
    /// Staleness is re-checked under the write lock, so a heartbeat that
    /// lands between the scan and the removal keeps the connection.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let candidates = self.inner.read().connections.list_stale(now, timeout);
        let evicted: Vec<ConnectionId> = candidates
            .into_iter()
            .filter(|id| self.remove_if(id, |state| state.is_stale(now, timeout)))
            .collect();
        if !evicted.is_empty() {
            counter!(HUB_EVICTIONS_TOTAL).increment(evicted.len() as u64);
            info!(
                count = evicted.len(),
                timeout_secs = timeout.as_secs(),
                "evicted stale connections"
            );
        }
        evicted
    }

    /// Cancel every connection's token. Handlers observe this and
    /// disconnect; new connections are rejected by the server.
    pub fn shutdown(&self) {
        if !self.root.is_cancelled() {
            info!(active = self.connection_count(), "connection manager shutting down");
            self.root.cancel();
        }
    }

    /// Whether [`Self::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Shared state of a registered connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.inner
            .read()
            .connections
            .get(id)
            .map(|entry| Arc::clone(&entry.state))
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Ids of every registered connection.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().connections.ids()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.read().topics.topic_count()
    }

    /// Number of subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.read().topics.subscriber_count(topic)
    }

    /// Whether `id` is subscribed to `topic`.
    pub fn is_subscribed(&self, id: &ConnectionId, topic: &str) -> bool {
        self.inner.read().topics.is_subscribed(id, topic)
    }

    /// Sorted topics of a registered connection.
    pub fn topics_of(&self, id: &ConnectionId) -> Option<Vec<String>> {
        self.inner
            .read()
            .connections
            .get(id)
            .map(|entry| entry.topics.iter().cloned().collect())
    }

    /// `(topic, subscriber count)` pairs sorted by topic.
    pub fn topic_summary(&self) -> Vec<(String, usize)> {
        self.inner.read().topics.summary()
    }

    fn deliver(conn: &ConnectionState, frame: &Arc<String>) -> Delivery {
        match conn.send(Arc::clone(frame)) {
            Ok(()) => Delivery::Delivered,
            Err(TransportError::Full) => {
                counter!(HUB_MESSAGES_DROPPED_TOTAL).increment(1);
                let drops = conn.drop_count();
                if drops >= MAX_TOTAL_DROPS {
                    warn!(conn_id = %conn.id, drops, "send queue persistently full, disconnecting");
                    counter!(HUB_DELIVERY_FAILURES_TOTAL).increment(1);
                    Delivery::Failed
                } else {
                    warn!(conn_id = %conn.id, drops, "send queue full, dropping frame");
                    Delivery::Dropped
                }
            }
            Err(e) => {
                warn!(conn_id = %conn.id, error = %e, "delivery failed, disconnecting");
                counter!(HUB_DELIVERY_FAILURES_TOTAL).increment(1);
                Delivery::Failed
            }
        }
    }

    fn remove_if(&self, id: &ConnectionId, predicate: impl FnOnce(&ConnectionState) -> bool) -> bool {
        let (entry, active) = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let matched = inner
                .connections
                .get(id)
                .is_some_and(|entry| predicate(&entry.state));
            if !matched {
                return false;
            }
            let Some(entry) = inner.connections.remove(id) else {
                return false;
            };
            let _ = inner
                .topics
                .remove_connection_everywhere(id, entry.topics.iter().map(String::as_str));
            (entry, inner.connections.len())
        };

        let _ = entry.state.release();
        counter!(HUB_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(HUB_CONNECTIONS_ACTIVE).set(active as f64);
        info!(
            conn_id = %id,
            topics = entry.topics.len(),
            duration_secs = entry.state.age().as_secs(),
            dropped = entry.state.drop_count(),
            metadata = ?entry.state.metadata(),
            active,
            "connection disconnected"
        );
        true
    }

    /// Check that the two registries mirror each other.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let inner = self.inner.read();
        for (id, entry) in inner.connections.iter() {
            for topic in &entry.topics {
                assert!(
                    inner.topics.is_subscribed(id, topic),
                    "{id} lists {topic} but topic registry disagrees"
                );
            }
        }
        for (topic, _) in inner.topics.summary() {
            for id in inner.topics.subscribers_of(&topic) {
                let entry = inner
                    .connections
                    .get(&id)
                    .unwrap_or_else(|| panic!("{topic} has unregistered subscriber {id}"));
                assert!(entry.topics.contains(&topic));
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .field("topics", &self.topic_count())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::ChannelTransport;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn send(&self, _frame: Arc<String>) -> Result<(), TransportError> {
            Err(TransportError::Io("socket reset".into()))
        }

        fn close(&self) {}
    }

    fn connect(
        manager: &ConnectionManager,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<Arc<String>>) {
        let (transport, rx) = ChannelTransport::new(capacity);
        let id = manager.connect(Arc::new(transport), Metadata::new()).unwrap();
        (id, rx)
    }

    fn recv_json(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let frame = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn connect_registers_with_no_topics() {
        let manager = ConnectionManager::new(8);
        let (id, _rx) = connect(&manager, 4);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.topics_of(&id), Some(vec![]));
        assert!(id.as_str().starts_with("conn_"));
    }

    #[test]
    fn connect_rejects_over_capacity() {
        let manager = ConnectionManager::new(1);
        let (_id, _rx) = connect(&manager, 4);
        let (transport, _rx2) = ChannelTransport::new(4);
        let err = manager
            .connect(Arc::new(transport), Metadata::new())
            .unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded { limit: 1 });
        assert_eq!(manager.connection_count(), 1);
    }

    #[test]
    fn subscribe_unknown_connection_errors() {
        let manager = ConnectionManager::new(8);
        let ghost = ConnectionId::from("ghost");
        assert_eq!(
            manager.subscribe(&ghost, "alerts"),
            Err(RegistryError::UnknownConnection(ghost.clone()))
        );
        assert_eq!(manager.topic_count(), 0);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let manager = ConnectionManager::new(8);
        let (id, _rx) = connect(&manager, 4);
        assert_eq!(manager.subscribe(&id, "alerts"), Ok(true));
        assert_eq!(manager.subscribe(&id, "alerts"), Ok(false));
        assert_eq!(manager.subscriber_count("alerts"), 1);
        manager.assert_consistent();
    }

    #[test]
    fn broadcast_reaches_exactly_the_subscribers() {
        let manager = ConnectionManager::new(8);
        let (a, mut rx_a) = connect(&manager, 4);
        let (b, mut rx_b) = connect(&manager, 4);
        let (_c, mut rx_c) = connect(&manager, 4);
        let _ = manager.subscribe(&a, "wait_events").unwrap();
        let _ = manager.subscribe(&b, "wait_events").unwrap();

        let report = manager.broadcast(
            "wait_events",
            &ServerMessage::data("wait_events", json!({"count": 3})),
        );
        assert_eq!(report.delivered, 2);
        assert_eq!(report.attempted(), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = recv_json(rx);
            assert_eq!(frame["type"], "data");
            assert_eq!(frame["topic"], "wait_events");
            assert_eq!(frame["data"]["count"], 3);
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn unsubscribed_connection_misses_later_broadcasts() {
        let manager = ConnectionManager::new(8);
        let (a, mut rx_a) = connect(&manager, 4);
        let (b, mut rx_b) = connect(&manager, 4);
        let _ = manager.subscribe(&a, "alerts").unwrap();
        let _ = manager.subscribe(&b, "alerts").unwrap();
        assert_eq!(manager.unsubscribe(&a, "alerts"), Ok(true));

        let report = manager.broadcast("alerts", &ServerMessage::data("alerts", json!("x")));
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(recv_json(&mut rx_b)["data"], "x");
        assert!(!manager.is_subscribed(&a, "alerts"));
        manager.assert_consistent();
    }

    #[test]
    fn broadcast_without_subscribers_is_noop() {
        let manager = ConnectionManager::new(8);
        let (_a, mut rx) = connect(&manager, 4);
        let report = manager.broadcast("nobody", &ServerMessage::data("nobody", json!(1)));
        assert_eq!(report, BroadcastReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_subscriber_is_removed_and_others_still_receive() {
        let manager = ConnectionManager::new(8);
        let (good, mut rx_good) = connect(&manager, 4);
        let bad = manager
            .connect(Arc::new(BrokenTransport), Metadata::new())
            .unwrap();
        let _ = manager.subscribe(&good, "t").unwrap();
        let _ = manager.subscribe(&bad, "t").unwrap();

        let report = manager.broadcast("t", &ServerMessage::data("t", json!({"n": 1})));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.disconnected, vec![bad.clone()]);
        assert_eq!(recv_json(&mut rx_good)["data"]["n"], 1);

        assert!(manager.connection(&bad).is_none());
        assert_eq!(manager.subscriber_count("t"), 1);
        manager.assert_consistent();
    }

    #[test]
    fn closed_receiver_counts_as_failure() {
        let manager = ConnectionManager::new(8);
        let (id, rx) = connect(&manager, 4);
        let _ = manager.subscribe(&id, "t").unwrap();
        drop(rx);
        let report = manager.broadcast("t", &ServerMessage::data("t", json!(null)));
        assert_eq!(report.disconnected, vec![id]);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.topic_count(), 0);
    }

    #[test]
    fn full_queue_drops_until_limit_then_disconnects() {
        let manager = ConnectionManager::new(8);
        let (id, _rx) = connect(&manager, 1);
        let _ = manager.subscribe(&id, "t").unwrap();
        let msg = ServerMessage::data("t", json!(0));

        assert_eq!(manager.broadcast("t", &msg).delivered, 1);
        for _ in 1..MAX_TOTAL_DROPS {
            let report = manager.broadcast("t", &msg);
            assert_eq!(report.dropped, 1);
        }
        assert!(manager.connection(&id).is_some());

        let report = manager.broadcast("t", &msg);
        assert_eq!(report.disconnected, vec![id.clone()]);
        assert!(manager.connection(&id).is_none());
    }

    #[test]
    fn disconnect_removes_from_every_topic() {
        let manager = ConnectionManager::new(8);
        let (a, _rx_a) = connect(&manager, 4);
        let (b, _rx_b) = connect(&manager, 4);
        for topic in ["t1", "t2", "t3"] {
            let _ = manager.subscribe(&a, topic).unwrap();
        }
        let _ = manager.subscribe(&b, "t2").unwrap();

        assert!(manager.disconnect(&a));
        assert_eq!(manager.topic_summary(), vec![("t2".to_owned(), 1)]);
        assert!(!manager.is_subscribed(&a, "t1"));
        manager.assert_consistent();
    }

    #[test]
    fn disconnect_is_idempotent() {
        let manager = ConnectionManager::new(8);
        let (id, _rx) = connect(&manager, 4);
        let state = manager.connection(&id).unwrap();
        assert!(manager.disconnect(&id));
        assert!(!manager.disconnect(&id));
        assert!(!state.is_alive());
        assert!(state.closed_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disconnects_release_once() {
        let manager = Arc::new(ConnectionManager::new(8));
        let (id, _rx) = connect(&manager, 4);
        let _ = manager.subscribe(&id, "t").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                tokio::spawn(async move { manager.disconnect(&id) })
            })
            .collect();
        let mut removed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.topic_count(), 0);
    }

    #[test]
    fn heartbeat_replies_with_pong() {
        let manager = ConnectionManager::new(8);
        let (id, mut rx) = connect(&manager, 4);
        assert!(manager.handle_heartbeat(&id));
        let frame = recv_json(&mut rx);
        assert_eq!(frame["type"], "pong");
        assert!(frame["timestamp"].is_f64());
    }

    #[test]
    fn heartbeat_for_unknown_connection_is_ignored() {
        let manager = ConnectionManager::new(8);
        let ghost = ConnectionId::from("ghost");
        assert!(!manager.handle_heartbeat(&ghost));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn send_to_one_targets_single_connection() {
        let manager = ConnectionManager::new(8);
        let (a, mut rx_a) = connect(&manager, 4);
        let (_b, mut rx_b) = connect(&manager, 4);
        assert!(manager.send_to_one(&a, &ServerMessage::error("Invalid JSON format")));
        let frame = recv_json(&mut rx_a);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], "Invalid JSON format");
        assert!(rx_b.try_recv().is_err());
        assert!(!manager.send_to_one(&ConnectionId::from("ghost"), &ServerMessage::pong()));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_stale_connections() {
        let manager = ConnectionManager::new(8);
        let (stale, _rx1) = connect(&manager, 4);
        let (live, _rx2) = connect(&manager, 4);
        let _ = manager.subscribe(&stale, "t").unwrap();
        let _ = manager.subscribe(&live, "t").unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(manager.touch_heartbeat(&live));
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = manager.sweep_stale(Duration::from_secs(60));
        assert_eq!(evicted, vec![stale.clone()]);
        assert!(manager.connection(&stale).is_none());
        assert_eq!(manager.subscriber_count("t"), 1);
        manager.assert_consistent();
    }

    #[test]
    fn shutdown_cancels_connection_tokens() {
        let manager = ConnectionManager::new(8);
        let (id, _rx) = connect(&manager, 4);
        let token = manager.connection(&id).unwrap().closed_token();
        assert!(!manager.is_shutting_down());
        manager.shutdown();
        assert!(manager.is_shutting_down());
        assert!(token.is_cancelled());
    }
}
