//! Handler lifecycle state and the client-tunable poll interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use streamhub_core::{ConnectionId, RegistryError};

/// Lifecycle of one protocol handler. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerState {
    /// Registering with the connection manager.
    Connecting,
    /// Both loops running.
    Active,
    /// Loops cancelled, waiting for them to finish.
    Closing,
    /// Deregistered.
    Closed,
}

/// Why a handler stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection or its stream ended.
    ClientClosed,
    /// Reading from the client failed.
    TransportError(String),
    /// The connection was removed elsewhere: stale heartbeat, failed
    /// delivery, or server shutdown.
    Evicted,
    /// The producer loop panicked.
    ProducerFailed(String),
    /// Registration was refused.
    Rejected(RegistryError),
}

/// Result of [`super::ProtocolHandler::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Id the connection was registered under, if registration succeeded.
    pub connection_id: Option<ConnectionId>,
    /// Why the handler stopped.
    pub reason: CloseReason,
}

/// Producer loop interval, adjustable by the client at runtime.
///
/// Values are clamped to `[min, max]`; the producer reads the current value
/// before every wait, so a change applies from the next wait on.
#[derive(Debug)]
pub struct PollInterval {
    millis: AtomicU64,
    min: Duration,
    max: Duration,
}

impl PollInterval {
    /// Create an interval starting at `initial`, clamped to `[min, max]`.
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        let initial = initial.clamp(min, max);
        Self {
            millis: AtomicU64::new(as_millis(initial)),
            min,
            max,
        }
    }

    /// Current interval.
    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }

    /// Set the interval from a client-supplied number of seconds.
    ///
    /// Returns the effective (clamped) interval.
    pub fn set_secs(&self, secs: f64) -> Duration {
        let effective = self.clamp_secs(secs);
        self.millis.store(as_millis(effective), Ordering::Relaxed);
        effective
    }

    /// Clamp `secs` to the allowed range. NaN and infinities map to the minimum.
    pub fn clamp_secs(&self, secs: f64) -> Duration {
        if !secs.is_finite() {
            return self.min;
        }
        let clamped = secs.clamp(self.min.as_secs_f64(), self.max.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        self.max
    }
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval() -> PollInterval {
        PollInterval::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn states_are_ordered() {
        assert!(HandlerState::Connecting < HandlerState::Active);
        assert!(HandlerState::Active < HandlerState::Closing);
        assert!(HandlerState::Closing < HandlerState::Closed);
    }

    #[test]
    fn starts_at_initial() {
        assert_eq!(interval().get(), Duration::from_secs(5));
    }

    #[test]
    fn initial_is_clamped() {
        let pi = PollInterval::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        assert_eq!(pi.get(), Duration::from_secs(1));
    }

    #[test]
    fn below_minimum_clamps_up() {
        let pi = interval();
        assert_eq!(pi.set_secs(0.1), Duration::from_secs(1));
        assert_eq!(pi.get(), Duration::from_secs(1));
    }

    #[test]
    fn above_maximum_clamps_down() {
        let pi = interval();
        assert_eq!(pi.set_secs(1e9), Duration::from_secs(3600));
    }

    #[test]
    fn fractional_seconds_kept() {
        let pi = interval();
        assert_eq!(pi.set_secs(2.5), Duration::from_millis(2500));
        assert_eq!(pi.get(), Duration::from_millis(2500));
    }

    #[test]
    fn non_finite_maps_to_minimum() {
        let pi = interval();
        assert_eq!(pi.set_secs(f64::NAN), Duration::from_secs(1));
        assert_eq!(pi.set_secs(f64::INFINITY), Duration::from_secs(1));
        assert_eq!(pi.set_secs(-3.0), Duration::from_secs(1));
    }

    #[test]
    fn inverted_bounds_collapse_to_min() {
        let pi = PollInterval::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        assert_eq!(pi.max(), Duration::from_secs(10));
        assert_eq!(pi.get(), Duration::from_secs(10));
    }
}
