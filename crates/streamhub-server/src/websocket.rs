//! Bridges an axum WebSocket to the transport-agnostic protocol handler.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, StreamExt};
use streamhub_core::TransportError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::hub::{ChannelTransport, ConnectionManager, Metadata};
use crate::protocol::{DataProducer, HandlerOptions, InboundFrame, ProtocolHandler};

/// Time the writer gets to flush the close frame after the handler ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A split WebSocket: queued outbound transport, inbound frame stream and the
/// writer task draining the queue into the socket.
pub struct WsBridge {
    /// Outbound half handed to the connection manager.
    pub transport: Arc<ChannelTransport>,
    /// Inbound frames for the consumer loop.
    pub inbound: BoxStream<'static, Result<InboundFrame, TransportError>>,
    /// Socket writer; ends once the transport is closed and drained.
    pub writer: JoinHandle<()>,
}

/// Split `socket` into a [`WsBridge`].
///
/// When `ping_interval` is set the writer also sends WebSocket Ping frames so
/// idle clients reply with Pongs that count as heartbeats.
pub fn bridge(socket: WebSocket, queue_capacity: usize, ping_interval: Option<Duration>) -> WsBridge {
    let (sink, stream) = socket.split();
    let (transport, rx) = ChannelTransport::new(queue_capacity);
    let writer = tokio::spawn(write_loop(sink, rx, ping_interval));
    let inbound = stream
        .filter_map(|msg| futures::future::ready(map_message(msg)))
        .boxed();
    WsBridge {
        transport: Arc::new(transport),
        inbound,
        writer,
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    ping_interval: Option<Duration>,
) {
    let pinging = ping_interval.is_some();
    let mut ticker = tokio::time::interval(ping_interval.unwrap_or(Duration::from_secs(3600)));
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.as_str().to_owned().into())).await.is_err() {
                        debug!("socket write failed, writer exiting");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick(), if pinging => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn map_message(
    msg: Result<Message, axum::Error>,
) -> Option<Result<InboundFrame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text.to_string()))),
        Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
            Ok(text) => Some(Ok(InboundFrame::Text(text.to_owned()))),
            Err(_) => {
                debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_)) => Some(Ok(InboundFrame::KeepAlive)),
        Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
        Err(e) => Some(Err(TransportError::Io(e.to_string()))),
    }
}

/// Everything a session needs besides its socket and topic.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// Shared connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Per-connection handler options.
    pub options: HandlerOptions,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// WebSocket Ping cadence, if enabled.
    pub ping_interval: Option<Duration>,
}

/// Run one WebSocket client against `topic` until it disconnects.
#[instrument(skip_all, fields(topic = %topic))]
pub async fn run_ws_session(
    socket: WebSocket,
    topic: String,
    producer: Arc<dyn DataProducer>,
    ctx: SessionContext,
    metadata: Metadata,
) {
    let WsBridge {
        transport,
        inbound,
        mut writer,
    } = bridge(socket, ctx.queue_capacity, ctx.ping_interval);

    let handler = ProtocolHandler::new(ctx.manager, topic, producer, ctx.options);
    let outcome = handler.run(transport, inbound, metadata).await;
    debug!(conn_id = ?outcome.connection_id, reason = ?outcome.reason, "session ended");

    // the handler closed the transport; let the writer send the close frame
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}
