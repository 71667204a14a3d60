//! Connection/topic pub-sub state.
//!
//! - [`topics::TopicRegistry`]: topic name → subscriber ids
//! - [`registry::ConnectionRegistry`]: connection id → connection entry
//! - [`manager::ConnectionManager`]: the only mutator of both registries
//! - [`sweeper`]: periodic eviction of connections whose heartbeat went stale

pub mod connection;
pub mod manager;
pub mod registry;
pub mod sweeper;
pub mod topics;

pub use connection::{ChannelTransport, ConnectionState, Metadata, Transport};
pub use manager::{BroadcastReport, ConnectionManager};
