//! Topic → subscriber index.

use std::collections::{HashMap, HashSet};

use streamhub_core::ConnectionId;

/// Maps each topic to the set of connections subscribed to it.
///
/// A topic exists exactly while it has at least one subscriber; the last
/// unsubscribe removes it.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HashSet<ConnectionId>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `topic`, creating the topic if needed.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(&mut self, conn: &ConnectionId, topic: &str) -> bool {
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .insert(conn.clone())
    }

    /// Remove `conn` from `topic`. Empty topics are dropped.
    ///
    /// Returns `true` if a subscription was removed.
    pub fn unsubscribe(&mut self, conn: &ConnectionId, topic: &str) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(conn);
        if members.is_empty() {
            let _ = self.topics.remove(topic);
        }
        removed
    }

    /// Snapshot of the subscribers of `topic`.
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashSet::len)
    }

    /// Whether `conn` is subscribed to `topic`.
    pub fn is_subscribed(&self, conn: &ConnectionId, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.contains(conn))
    }

    /// Remove `conn` from each of `topics`.
    ///
    /// Callers pass the connection's own topic set so this stays
    /// proportional to that connection's subscriptions. Returns the number
    /// of subscriptions removed.
    pub fn remove_connection_everywhere<'a>(
        &mut self,
        conn: &ConnectionId,
        topics: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        topics
            .into_iter()
            .filter(|topic| self.unsubscribe(conn, topic))
            .count()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// `(topic, subscriber count)` pairs sorted by topic name.
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut summary: Vec<_> = self
            .topics
            .iter()
            .map(|(topic, members)| (topic.clone(), members.len()))
            .collect();
        summary.sort();
        summary
    }
}
