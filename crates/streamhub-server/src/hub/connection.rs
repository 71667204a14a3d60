//! Per-connection state and the outbound transport seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use streamhub_core::{ConnectionId, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Freeform connection metadata (remote address, user agent, ...).
pub type Metadata = HashMap<String, serde_json::Value>;

/// Outbound half of a client connection.
///
/// `send` must not block: implementations queue the frame and let a writer
/// drain it, so a slow peer never stalls a broadcast.
pub trait Transport: Send + Sync {
    /// Queue one serialized frame for delivery.
    fn send(&self, frame: Arc<String>) -> Result<(), TransportError>;

    /// Release the transport. Later sends fail with [`TransportError::Closed`].
    fn close(&self);
}

/// [`Transport`] backed by a bounded channel drained by a socket writer task.
///
/// Closing drops the sender, which ends the writer once the queue drains.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<Arc<String>>>>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Arc<String>) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        drop(self.tx.lock().take());
    }
}

/// A registered client connection.
pub struct ConnectionState {
    /// Unique connection id.
    pub id: ConnectionId,
    transport: Arc<dyn Transport>,
    metadata: Metadata,
    /// When the connection was registered.
    pub connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    alive: AtomicBool,
    dropped_messages: AtomicU64,
    closed: CancellationToken,
}

impl ConnectionState {
    /// Create the state for a freshly registered connection.
    ///
    /// `closed` is cancelled when the connection is released.
    pub fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        metadata: Metadata,
        closed: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            metadata,
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            closed,
        }
    }

    /// Hand a frame to the transport.
    ///
    /// A full queue counts as a dropped message.
    pub fn send(&self, frame: Arc<String>) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let result = self.transport.send(frame);
        if matches!(result, Err(TransportError::Full)) {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Record a heartbeat.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time of the last heartbeat (or registration).
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Whether the last heartbeat is older than `timeout` as of `now`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat()) > timeout
    }

    /// False once the connection has been released.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Total frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Token cancelled when the connection is released.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Mark dead, close the transport and cancel [`Self::closed_token`].
    ///
    /// Returns `false` if the connection was already released.
    pub fn release(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.transport.close();
        self.closed.cancel();
        true
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
