//! Built-in producers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use streamhub_core::FetchError;

use crate::hub::ConnectionManager;
use crate::protocol::DataProducer;

/// Topic served by [`StatsProducer`].
pub const SERVER_STATS_TOPIC: &str = "server_stats";

/// Publishes hub occupancy: connection count, per-topic subscriber counts
/// and uptime.
pub struct StatsProducer {
    manager: Arc<ConnectionManager>,
    started: Instant,
}

impl StatsProducer {
    /// Report on `manager`, measuring uptime from now.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl DataProducer for StatsProducer {
    async fn fetch(&self) -> Result<Option<Value>, FetchError> {
        let topics: Map<String, Value> = self
            .manager
            .topic_summary()
            .into_iter()
            .map(|(topic, count)| (topic, Value::from(count)))
            .collect();
        Ok(Some(json!({
            "connections": self.manager.connection_count(),
            "topics": topics,
            "uptime_secs": self.started.elapsed().as_secs(),
        })))
    }
}
