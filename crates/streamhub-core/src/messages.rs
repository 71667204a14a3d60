//! Wire messages exchanged over a streaming connection.
//!
//! Every frame is a JSON object discriminated by its `type` field.
//!
//! Outbound ([`ServerMessage`]):
//! - `{"type":"data","topic":..,"data":..,"timestamp":..}`
//! - `{"type":"error","error":..,"timestamp":..}`
//! - `{"type":"ping"|"pong","timestamp":..}`
//!
//! Inbound ([`ClientFrame`]):
//! - `{"type":"ping"}` / `{"type":"pong"}`
//! - `{"type":"subscribe","topic":..}` / `{"type":"unsubscribe","topic":..}`
//! - `{"type":"configure","config":{"poll_interval":..}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FrameError;

/// Seconds since the Unix epoch with microsecond precision.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A frame sent from the server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A data snapshot published on a topic.
    Data {
        /// Topic the snapshot belongs to.
        topic: String,
        /// Producer payload.
        data: Value,
        /// Send time.
        timestamp: f64,
    },
    /// An error addressed to a single client.
    Error {
        /// Human-readable message.
        error: String,
        /// Send time.
        timestamp: f64,
    },
    /// Server-initiated liveness probe.
    Ping {
        /// Send time.
        timestamp: f64,
    },
    /// Reply to a client `ping`.
    Pong {
        /// Send time.
        timestamp: f64,
    },
}

impl ServerMessage {
    /// Build a `data` frame stamped with the current time.
    pub fn data(topic: impl Into<String>, data: Value) -> Self {
        Self::Data {
            topic: topic.into(),
            data,
            timestamp: unix_timestamp(),
        }
    }

    /// Build an `error` frame stamped with the current time.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: unix_timestamp(),
        }
    }

    /// Build a `pong` frame stamped with the current time.
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: unix_timestamp(),
        }
    }

    /// The `type` discriminator, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data { .. } => "data",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parameters of a `configure` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigureParams {
    /// Requested producer interval in seconds.
    #[serde(default)]
    pub poll_interval: Option<f64>,
}

/// A control frame sent from a client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Heartbeat; answered with a `pong`.
    Ping,
    /// Heartbeat reply to a server `ping`; not answered.
    Pong,
    /// Subscribe this connection to a topic.
    Subscribe {
        /// Topic name; frames without one are ignored.
        #[serde(default)]
        topic: Option<String>,
    },
    /// Unsubscribe this connection from a topic.
    Unsubscribe {
        /// Topic name; frames without one are ignored.
        #[serde(default)]
        topic: Option<String>,
    },
    /// Adjust per-connection settings.
    Configure {
        /// New settings.
        #[serde(default)]
        config: ConfigureParams,
    },
    /// Any other `type` value.
    #[serde(other)]
    Unknown,
}

/// Parse client text into a control frame.
///
/// Text that is not JSON yields [`FrameError::InvalidJson`]; JSON that does not
/// carry a usable `type` yields [`FrameError::Unrecognized`].
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
    serde_json::from_value(value).map_err(|e| FrameError::Unrecognized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_frame_wire_shape() {
        let msg = ServerMessage::data("wait_events", json!({"count": 3}));
        let parsed: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "data");
        assert_eq!(parsed["topic"], "wait_events");
        assert_eq!(parsed["data"], json!({"count": 3}));
        assert!(parsed["timestamp"].is_f64());
    }

    #[test]
    fn error_frame_wire_shape() {
        let msg = ServerMessage::error("Invalid JSON format");
        let parsed: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["error"], "Invalid JSON format");
        assert!(parsed["timestamp"].is_number());
        assert!(parsed.get("topic").is_none());
    }

    #[test]
    fn pong_frame_wire_shape() {
        let parsed: Value = serde_json::from_str(&ServerMessage::pong().to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "pong");
        assert!(parsed["timestamp"].is_number());
    }

    #[test]
    fn kind_matches_type_tag() {
        assert_eq!(ServerMessage::data("t", Value::Null).kind(), "data");
        assert_eq!(ServerMessage::error("e").kind(), "error");
        assert_eq!(ServerMessage::pong().kind(), "pong");
    }

    #[test]
    fn timestamp_is_recent() {
        let ts = unix_timestamp();
        // 2020-01-01T00:00:00Z
        assert!(ts > 1_577_836_800.0);
    }

    #[test]
    fn parse_ping() {
        assert_eq!(parse_client_frame(r#"{"type":"ping"}"#), Ok(ClientFrame::Ping));
    }

    #[test]
    fn parse_subscribe_with_topic() {
        let frame = parse_client_frame(r#"{"type":"subscribe","topic":"wait_events"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                topic: Some("wait_events".into())
            }
        );
    }

    #[test]
    fn parse_subscribe_without_topic() {
        let frame = parse_client_frame(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Subscribe { topic: None });
    }

    #[test]
    fn parse_unsubscribe() {
        let frame = parse_client_frame(r#"{"type":"unsubscribe","topic":"locks"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Unsubscribe {
                topic: Some("locks".into())
            }
        );
    }

    #[test]
    fn parse_configure() {
        let frame =
            parse_client_frame(r#"{"type":"configure","config":{"poll_interval":0.1}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Configure {
                config: ConfigureParams {
                    poll_interval: Some(0.1)
                }
            }
        );
    }

    #[test]
    fn parse_configure_without_config() {
        let frame = parse_client_frame(r#"{"type":"configure"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Configure {
                config: ConfigureParams::default()
            }
        );
    }

    #[test]
    fn parse_unknown_type() {
        let frame = parse_client_frame(r#"{"type":"shrug","x":1}"#).unwrap();
        assert_eq!(frame, ClientFrame::Unknown);
    }

    #[test]
    fn parse_invalid_json() {
        assert_eq!(parse_client_frame("not json"), Err(FrameError::InvalidJson));
        assert_eq!(parse_client_frame(""), Err(FrameError::InvalidJson));
    }

    #[test]
    fn parse_json_without_type_is_unrecognized() {
        let err = parse_client_frame(r#"{"topic":"x"}"#).unwrap_err();
        assert!(matches!(err, FrameError::Unrecognized(_)));
    }

    #[test]
    fn parse_wrong_field_type_is_unrecognized() {
        let err = parse_client_frame(r#"{"type":"subscribe","topic":5}"#).unwrap_err();
        assert!(matches!(err, FrameError::Unrecognized(_)));
    }

    #[test]
    fn parse_non_object_is_unrecognized() {
        let err = parse_client_frame("42").unwrap_err();
        assert!(matches!(err, FrameError::Unrecognized(_)));
    }
}
