//! # streamhub-core
//!
//! Shared vocabulary for the streamhub crates:
//!
//! - **Connection ids**: [`ConnectionId`], a UUID v7 backed newtype
//! - **Wire messages**: outbound [`ServerMessage`] frames and inbound [`ClientFrame`] control frames
//! - **Errors**: transport, frame, fetch and registry error enums via `thiserror`
//! - **Logging**: [`logging::init_subscriber`] for the global `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;

pub use errors::{FetchError, FrameError, RegistryError, TransportError};
pub use ids::ConnectionId;
pub use messages::{ClientFrame, ConfigureParams, ServerMessage, parse_client_frame, unix_timestamp};
