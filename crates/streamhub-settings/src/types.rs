//! Settings sections.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Network listener settings.
    pub server: ServerSettings,
    /// Per-connection protocol settings.
    pub protocol: ProtocolSettings,
    /// Stale-connection eviction settings.
    pub heartbeat: HeartbeatSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl HubSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.max_connections == 0 {
            return Err(invalid("server.maxConnections", "must be at least 1"));
        }
        if s.send_queue_capacity == 0 {
            return Err(invalid("server.sendQueueCapacity", "must be at least 1"));
        }

        let p = &self.protocol;
        if !(p.min_poll_interval_secs.is_finite() && p.min_poll_interval_secs > 0.0) {
            return Err(invalid(
                "protocol.minPollIntervalSecs",
                format!("must be a positive number, got {}", p.min_poll_interval_secs),
            ));
        }
        if !p.max_poll_interval_secs.is_finite()
            || p.max_poll_interval_secs < p.min_poll_interval_secs
        {
            return Err(invalid(
                "protocol.maxPollIntervalSecs",
                format!(
                    "must not be below minPollIntervalSecs ({}), got {}",
                    p.min_poll_interval_secs, p.max_poll_interval_secs
                ),
            ));
        }
        if !p.default_poll_interval_secs.is_finite()
            || p.default_poll_interval_secs < p.min_poll_interval_secs
            || p.default_poll_interval_secs > p.max_poll_interval_secs
        {
            return Err(invalid(
                "protocol.defaultPollIntervalSecs",
                format!(
                    "must lie within [{}, {}], got {}",
                    p.min_poll_interval_secs,
                    p.max_poll_interval_secs,
                    p.default_poll_interval_secs
                ),
            ));
        }

        let h = &self.heartbeat;
        if h.timeout_secs == 0 {
            return Err(invalid("heartbeat.timeoutSecs", "must be at least 1"));
        }
        if h.sweep_interval_secs == 0 {
            return Err(invalid("heartbeat.sweepIntervalSecs", "must be at least 1"));
        }

        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::invalid(field, reason)
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum number of concurrently registered connections.
    pub max_connections: usize,
    /// Outbound frames buffered per connection before frames are dropped.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Interval between WebSocket-level Ping frames; `0` disables them.
    pub ws_ping_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_connections: 1024,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            ws_ping_interval_secs: 30,
        }
    }
}

/// Per-connection protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSettings {
    /// Producer interval used until a client sends `configure`.
    pub default_poll_interval_secs: f64,
    /// Lower clamp for client-requested intervals.
    pub min_poll_interval_secs: f64,
    /// Upper clamp for client-requested intervals.
    pub max_poll_interval_secs: f64,
    /// Skip producer fetches while the handler's topic has no subscribers.
    pub skip_idle_topics: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            default_poll_interval_secs: 5.0,
            min_poll_interval_secs: 1.0,
            max_poll_interval_secs: 3600.0,
            skip_idle_topics: true,
        }
    }
}

/// Stale-connection eviction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// A connection silent for longer than this is evicted.
    pub timeout_secs: u64,
    /// How often the sweeper looks for stale connections.
    pub sweep_interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
