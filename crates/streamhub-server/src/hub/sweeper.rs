//! Periodic eviction of connections whose heartbeat went stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::ConnectionManager;

/// Spawn [`run_sweeper`] on the current runtime.
pub fn spawn_sweeper(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(manager, interval, timeout, cancel))
}

/// Every `interval`, evict connections silent for longer than `timeout`.
///
/// Runs until `cancel` fires. The first sweep happens one full interval
/// after start.
pub async fn run_sweeper(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval() fires immediately; skip that tick
    let _ = ticker.tick().await;

    debug!(
        interval_secs = interval.as_secs(),
        timeout_secs = timeout.as_secs(),
        "heartbeat sweeper started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = manager.sweep_stale(timeout);
            }
            () = cancel.cancelled() => {
                debug!("heartbeat sweeper stopped");
                return;
            }
        }
    }
}
