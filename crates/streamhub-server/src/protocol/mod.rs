//! Per-connection protocol handler.
//!
//! Each accepted connection runs one [`ProtocolHandler`]: a producer loop
//! that fetches from a [`DataProducer`] and broadcasts to the handler's
//! topic, and a consumer loop that interprets client control frames. The two
//! loops share a cancellation scope; when either ends, both stop and the
//! connection is deregistered.

pub mod handler;
pub mod producer;
pub mod state;

pub use handler::{HandlerOptions, InboundFrame, ProtocolHandler};
pub use producer::{DataProducer, FnProducer, ProducerCatalog, producer_fn};
pub use state::{CloseReason, HandlerOutcome, HandlerState, PollInterval};
