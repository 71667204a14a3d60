//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamhub_settings::{HubSettings, ProtocolSettings};

use crate::protocol::HandlerOptions;

/// Runtime configuration for [`crate::HubServer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrently registered connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message, in bytes.
    pub max_message_size: usize,
    /// WebSocket Ping cadence; `0` disables.
    pub ws_ping_interval_secs: u64,
    /// Evict connections silent for longer than this.
    pub heartbeat_timeout_secs: u64,
    /// Sweeper cadence.
    pub sweep_interval_secs: u64,
    /// Producer loop settings.
    pub protocol: ProtocolSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for ServerConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            send_queue_capacity: settings.server.send_queue_capacity,
            max_message_size: settings.server.max_message_size,
            ws_ping_interval_secs: settings.server.ws_ping_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat.timeout_secs,
            sweep_interval_secs: settings.heartbeat.sweep_interval_secs,
            protocol: settings.protocol.clone(),
        }
    }
}

impl ServerConfig {
    /// Options for each connection's protocol handler.
    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions::from(&self.protocol)
    }

    /// WebSocket Ping cadence, if enabled.
    pub fn ws_ping_interval(&self) -> Option<Duration> {
        (self.ws_ping_interval_secs > 0).then(|| Duration::from_secs(self.ws_ping_interval_secs))
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Sweeper cadence, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
