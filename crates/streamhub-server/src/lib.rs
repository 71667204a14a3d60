//! # streamhub-server
//!
//! Topic pub-sub hub over WebSocket.
//!
//! - [`hub`]: connection and topic registries behind a single
//!   [`ConnectionManager`], plus the heartbeat sweeper
//! - [`protocol`]: the per-connection dual-loop [`ProtocolHandler`]
//!   (producer loop + control-frame consumer loop)
//! - [`websocket`]: bridges axum WebSockets to the handler
//! - [`server`]: HTTP routes (`/ws/{topic}`, `/health`, `/topics`, `/metrics`)
//!   and graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod producers;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use hub::{BroadcastReport, ChannelTransport, ConnectionManager, Metadata, Transport};
pub use producers::{SERVER_STATS_TOPIC, StatsProducer};
pub use protocol::{
    CloseReason, DataProducer, HandlerOptions, HandlerOutcome, HandlerState, InboundFrame,
    ProducerCatalog, ProtocolHandler, producer_fn,
};
pub use server::{HubServer, ServerError};
pub use shutdown::ShutdownCoordinator;
