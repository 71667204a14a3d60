//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed for this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names shared by the hub and the protocol handler.

/// Connections registered (counter).
pub const HUB_CONNECTIONS_TOTAL: &str = "hub_connections_total";
/// Currently registered connections (gauge).
pub const HUB_CONNECTIONS_ACTIVE: &str = "hub_connections_active";
/// Connections deregistered (counter).
pub const HUB_DISCONNECTIONS_TOTAL: &str = "hub_disconnections_total";
/// Connections evicted by the heartbeat sweeper (counter).
pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
/// Broadcasts with at least one recipient (counter, labels: topic).
pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
/// Deliveries that failed and forced a disconnect (counter).
pub const HUB_DELIVERY_FAILURES_TOTAL: &str = "hub_delivery_failures_total";
/// Frames dropped because a send queue was full (counter).
pub const HUB_MESSAGES_DROPPED_TOTAL: &str = "hub_messages_dropped_total";
/// Producer fetch failures (counter, labels: topic).
pub const HUB_FETCH_ERRORS_TOTAL: &str = "hub_fetch_errors_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        // Local recorder, so tests never fight over the global one.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(HUB_CONNECTIONS_TOTAL).increment(2);
        });
        let output = render(&handle);
        assert!(output.contains(HUB_CONNECTIONS_TOTAL));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            HUB_CONNECTIONS_TOTAL,
            HUB_CONNECTIONS_ACTIVE,
            HUB_DISCONNECTIONS_TOTAL,
            HUB_EVICTIONS_TOTAL,
            HUB_BROADCASTS_TOTAL,
            HUB_DELIVERY_FAILURES_TOTAL,
            HUB_MESSAGES_DROPPED_TOTAL,
            HUB_FETCH_ERRORS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("hub_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
