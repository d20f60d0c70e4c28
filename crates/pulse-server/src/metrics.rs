//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle `/metrics` renders from. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Devices admitted (counter).
pub const SYNC_CONNECTIONS_TOTAL: &str = "sync_connections_total";
/// Devices gone, any reason (counter, labels: reason).
pub const SYNC_DISCONNECTIONS_TOTAL: &str = "sync_disconnections_total";
/// Live devices (gauge).
pub const SYNC_CONNECTIONS_ACTIVE: &str = "sync_connections_active";
/// Credentials refused by the handshake (counter, labels: reason).
pub const SYNC_HANDSHAKE_REJECTIONS_TOTAL: &str = "sync_handshake_rejections_total";
/// Upgrades turned away before the handshake, at capacity or while shutting
/// down (counter, labels: reason).
pub const SYNC_UPGRADE_REFUSALS_TOTAL: &str = "sync_upgrade_refusals_total";
/// Events fanned out (counter, labels: type).
pub const SYNC_EVENTS_PUBLISHED_TOTAL: &str = "sync_events_published_total";
/// Per-connection delivery failures (counter, labels: reason).
pub const SYNC_DELIVERY_FAILURES_TOTAL: &str = "sync_delivery_failures_total";
/// Connections removed by the idle reaper (counter).
pub const SYNC_REAPED_TOTAL: &str = "sync_reaped_total";
/// Inbound application frames (counter, labels: type).
pub const SYNC_INBOUND_EVENTS_TOTAL: &str = "sync_inbound_events_total";
/// Inbound frames answered with an error (counter, labels: code).
pub const SYNC_INBOUND_ERRORS_TOTAL: &str = "sync_inbound_errors_total";
/// Device session length in seconds (histogram).
pub const SYNC_SESSION_DURATION_SECONDS: &str = "sync_session_duration_seconds";
/// Accepted goal transitions (counter, labels: event).
pub const GOAL_TRANSITIONS_TOTAL: &str = pulse_goals::service::GOAL_TRANSITIONS_TOTAL;
/// Rejected goal events (counter, labels: code).
pub const GOAL_REJECTIONS_TOTAL: &str = pulse_goals::service::GOAL_REJECTIONS_TOTAL;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(SYNC_CONNECTIONS_TOTAL).increment(3);
        });
        let output = render(&handle);
        assert!(output.contains("sync_connections_total 3"), "{output}");
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            SYNC_CONNECTIONS_TOTAL,
            SYNC_DISCONNECTIONS_TOTAL,
            SYNC_CONNECTIONS_ACTIVE,
            SYNC_HANDSHAKE_REJECTIONS_TOTAL,
            SYNC_UPGRADE_REFUSALS_TOTAL,
            SYNC_EVENTS_PUBLISHED_TOTAL,
            SYNC_DELIVERY_FAILURES_TOTAL,
            SYNC_REAPED_TOTAL,
            SYNC_INBOUND_EVENTS_TOTAL,
            SYNC_INBOUND_ERRORS_TOTAL,
            SYNC_SESSION_DURATION_SECONDS,
            GOAL_TRANSITIONS_TOTAL,
            GOAL_REJECTIONS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
