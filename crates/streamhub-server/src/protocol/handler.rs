//! The dual-loop protocol handler.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use metrics::counter;
use streamhub_core::{
    ClientFrame, ConnectionId, FrameError, ServerMessage, TransportError, parse_client_frame,
};
use streamhub_settings::ProtocolSettings;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::producer::DataProducer;
use super::state::{CloseReason, HandlerOutcome, HandlerState, PollInterval};
use crate::hub::{ConnectionManager, Metadata, Transport};
use crate::metrics::HUB_FETCH_ERRORS_TOTAL;

/// One inbound event from the client transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame, expected to hold a JSON control frame.
    Text(String),
    /// Transport-level keepalive (WebSocket ping/pong).
    KeepAlive,
    /// The client asked to close.
    Close,
}

/// Tunables for a [`ProtocolHandler`].
#[derive(Clone, Debug)]
pub struct HandlerOptions {
    /// Producer interval until the client sends `configure`.
    pub poll_interval: Duration,
    /// Lower clamp for client-requested intervals.
    pub min_poll_interval: Duration,
    /// Upper clamp for client-requested intervals.
    pub max_poll_interval: Duration,
    /// Skip fetches while the handler's topic has no subscribers.
    pub skip_idle_topics: bool,
    /// How long to wait for the losing loop after cancellation before
    /// aborting it.
    pub shutdown_grace: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::from(&ProtocolSettings::default())
    }
}

impl From<&ProtocolSettings> for HandlerOptions {
    fn from(settings: &ProtocolSettings) -> Self {
        Self {
            poll_interval: secs(settings.default_poll_interval_secs),
            min_poll_interval: secs(settings.min_poll_interval_secs),
            max_poll_interval: secs(settings.max_poll_interval_secs),
            skip_idle_topics: settings.skip_idle_topics,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Runs one client connection: registration, the producer and consumer
/// loops, and guaranteed deregistration.
pub struct ProtocolHandler {
    manager: Arc<ConnectionManager>,
    topic: String,
    producer: Arc<dyn DataProducer>,
    options: HandlerOptions,
    interval: Arc<PollInterval>,
    state: watch::Sender<HandlerState>,
}

impl ProtocolHandler {
    /// Create a handler that will serve `topic` from `producer`.
    pub fn new(
        manager: Arc<ConnectionManager>,
        topic: impl Into<String>,
        producer: Arc<dyn DataProducer>,
        options: HandlerOptions,
    ) -> Self {
        let interval = Arc::new(PollInterval::new(
            options.poll_interval,
            options.min_poll_interval,
            options.max_poll_interval,
        ));
        let (state, _) = watch::channel(HandlerState::Connecting);
        Self {
            manager,
            topic: topic.into(),
            producer,
            options,
            interval,
            state,
        }
    }

    /// Topic this handler produces for.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    /// Current producer interval.
    pub fn poll_interval(&self) -> Duration {
        self.interval.get()
    }

    /// Serve one connection until the client leaves, the transport fails,
    /// or the connection is evicted.
    ///
    /// The connection is always deregistered before this returns, and also
    /// when the returned future is dropped early.
    pub async fn run<S>(
        &self,
        transport: Arc<dyn Transport>,
        inbound: S,
        metadata: Metadata,
    ) -> HandlerOutcome
    where
        S: Stream<Item = Result<InboundFrame, TransportError>> + Send + Unpin + 'static,
    {
        let conn_id = match self.manager.connect(transport, metadata) {
            Ok(id) => id,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "connection rejected");
                self.transition(HandlerState::Closed);
                return HandlerOutcome {
                    connection_id: None,
                    reason: CloseReason::Rejected(e),
                };
            }
        };

        let deregister = Deregister {
            handler: self,
            conn_id: conn_id.clone(),
        };
        let span = info_span!("connection", conn_id = %conn_id, topic = %self.topic);
        let reason = self.serve(&conn_id, inbound).instrument(span).await;
        drop(deregister);
        info!(conn_id = %conn_id, topic = %self.topic, ?reason, "handler closed");

        HandlerOutcome {
            connection_id: Some(conn_id),
            reason,
        }
    }

    async fn serve<S>(&self, conn_id: &ConnectionId, inbound: S) -> CloseReason
    where
        S: Stream<Item = Result<InboundFrame, TransportError>> + Send + Unpin + 'static,
    {
        let Some(connection) = self.manager.connection(conn_id) else {
            return CloseReason::Evicted;
        };
        if let Err(e) = self.manager.subscribe(conn_id, &self.topic) {
            warn!(error = %e, "subscribe to own topic failed");
            return CloseReason::Evicted;
        }
        self.transition(HandlerState::Active);
        debug!(
            poll_interval_ms = u64::try_from(self.interval.get().as_millis()).unwrap_or(u64::MAX),
            "handler active"
        );

        let scope = connection.closed_token().child_token();
        let _cancel_on_drop = scope.clone().drop_guard();
        let producer = ProducerLoop {
            manager: Arc::clone(&self.manager),
            topic: self.topic.clone(),
            producer: Arc::clone(&self.producer),
            interval: Arc::clone(&self.interval),
            skip_idle_topics: self.options.skip_idle_topics,
        };
        let consumer = ConsumerLoop {
            manager: Arc::clone(&self.manager),
            conn_id: conn_id.clone(),
            interval: Arc::clone(&self.interval),
        };

        let mut producer_task = tokio::spawn(producer.run(scope.clone()).in_current_span());
        let mut consumer_task = tokio::spawn(consumer.run(inbound, scope.clone()).in_current_span());

        let first = tokio::select! {
            res = &mut producer_task => Finished::Producer(res),
            res = &mut consumer_task => Finished::Consumer(res),
        };

        self.transition(HandlerState::Closing);
        scope.cancel();

        let grace = self.options.shutdown_grace;
        match first {
            Finished::Producer(res) => {
                reap(consumer_task, grace, "consumer").await;
                match res {
                    Ok(()) => CloseReason::Evicted,
                    Err(e) => {
                        warn!(error = %e, "producer loop failed");
                        CloseReason::ProducerFailed(e.to_string())
                    }
                }
            }
            Finished::Consumer(res) => {
                reap(producer_task, grace, "producer").await;
                match res {
                    Ok(reason) => reason,
                    Err(e) => {
                        warn!(error = %e, "consumer loop failed");
                        CloseReason::TransportError(e.to_string())
                    }
                }
            }
        }
    }

    fn transition(&self, to: HandlerState) {
        let _ = self.state.send_if_modified(|current| {
            if to > *current {
                trace!(from = ?*current, ?to, "handler state");
                *current = to;
                true
            } else {
                false
            }
        });
    }
}

/// Moves the handler to `Closed` and deregisters its connection when `run`
/// finishes or its future is dropped. Releasing the connection cancels the
/// loop scope.
struct Deregister<'a> {
    handler: &'a ProtocolHandler,
    conn_id: ConnectionId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        self.handler.transition(HandlerState::Closing);
        let _ = self.handler.manager.disconnect(&self.conn_id);
        self.handler.transition(HandlerState::Closed);
    }
}

enum Finished {
    Producer(Result<(), JoinError>),
    Consumer(Result<CloseReason, JoinError>),
}

/// Wait up to `grace` for a cancelled loop, then abort it.
async fn reap<T>(mut handle: JoinHandle<T>, grace: Duration, name: &'static str) {
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        warn!(task = name, "loop did not stop within grace period, aborting");
        handle.abort();
    }
}

/// Fetch, broadcast, wait; repeat until cancelled.
struct ProducerLoop {
    manager: Arc<ConnectionManager>,
    topic: String,
    producer: Arc<dyn DataProducer>,
    interval: Arc<PollInterval>,
    skip_idle_topics: bool,
}

impl ProducerLoop {
    async fn run(self, cancel: CancellationToken) {
        loop {
            if self.skip_idle_topics && self.manager.subscriber_count(&self.topic) == 0 {
                trace!("no subscribers, skipping fetch");
            } else {
                let fetched = tokio::select! {
                    () = cancel.cancelled() => return,
                    res = self.producer.fetch() => res,
                };
                match fetched {
                    Ok(Some(payload)) => {
                        let message = ServerMessage::data(self.topic.clone(), payload);
                        let _ = self.manager.broadcast(&self.topic, &message);
                    }
                    Ok(None) => trace!("producer had nothing new"),
                    Err(e) => {
                        counter!(HUB_FETCH_ERRORS_TOTAL, "topic" => self.topic.clone())
                            .increment(1);
                        warn!(error = %e, "fetch failed, retrying next interval");
                    }
                }
            }

            let wait = self.interval.get();
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Read client frames and apply them until the client leaves or the scope
/// is cancelled.
struct ConsumerLoop {
    manager: Arc<ConnectionManager>,
    conn_id: ConnectionId,
    interval: Arc<PollInterval>,
}

impl ConsumerLoop {
    async fn run<S>(self, mut inbound: S, cancel: CancellationToken) -> CloseReason
    where
        S: Stream<Item = Result<InboundFrame, TransportError>> + Send + Unpin,
    {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return CloseReason::Evicted,
                next = inbound.next() => next,
            };
            match next {
                None | Some(Ok(InboundFrame::Close)) => {
                    debug!("client closed");
                    return CloseReason::ClientClosed;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "inbound transport error");
                    return CloseReason::TransportError(e.to_string());
                }
                Some(Ok(InboundFrame::KeepAlive)) => {
                    let _ = self.manager.touch_heartbeat(&self.conn_id);
                }
                Some(Ok(InboundFrame::Text(text))) => self.dispatch(&text),
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_client_frame(text) {
            Ok(frame) => self.apply(frame),
            Err(FrameError::InvalidJson) => {
                debug!(len = text.len(), "invalid JSON from client");
                let reply = ServerMessage::error(FrameError::InvalidJson.to_string());
                let _ = self.manager.send_to_one(&self.conn_id, &reply);
            }
            Err(FrameError::Unrecognized(reason)) => {
                debug!(%reason, "ignoring unrecognized frame");
            }
        }
    }

    fn apply(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::Ping => {
                let _ = self.manager.handle_heartbeat(&self.conn_id);
            }
            ClientFrame::Pong => {
                let _ = self.manager.touch_heartbeat(&self.conn_id);
            }
            ClientFrame::Subscribe { topic } => match non_empty(topic) {
                Some(topic) => {
                    if let Err(e) = self.manager.subscribe(&self.conn_id, &topic) {
                        warn!(%topic, error = %e, "subscribe failed");
                    }
                }
                None => debug!("subscribe without topic, ignoring"),
            },
            ClientFrame::Unsubscribe { topic } => match non_empty(topic) {
                Some(topic) => {
                    if let Err(e) = self.manager.unsubscribe(&self.conn_id, &topic) {
                        warn!(%topic, error = %e, "unsubscribe failed");
                    }
                }
                None => debug!("unsubscribe without topic, ignoring"),
            },
            ClientFrame::Configure { config } => match config.poll_interval {
                Some(requested) => {
                    let effective = self.interval.set_secs(requested);
                    info!(
                        requested,
                        effective_secs = effective.as_secs_f64(),
                        "poll interval updated"
                    );
                }
                None => debug!("configure without changes"),
            },
            ClientFrame::Unknown => debug!("ignoring unknown message type"),
        }
    }
}

fn non_empty(topic: Option<String>) -> Option<String> {
    topic.filter(|t| !t.trim().is_empty())
}
