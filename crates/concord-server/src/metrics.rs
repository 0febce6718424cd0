//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;

use concord_core::SessionEvent;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "concord_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "concord_connections_active";
    pub const SESSIONS_TOTAL: &str = "concord_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "concord_sessions_active";
    pub const FRAMES_TOTAL: &str = "concord_frames_total";
    pub const FRAME_BYTES: &str = "concord_frame_bytes";
    pub const ERRORS_TOTAL: &str = "concord_errors_total";
}

/// Describe all metrics.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of transport connections since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of open connections");
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Total number of welcomed sessions");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of sessions");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::FRAME_BYTES, "Total frame payload bytes by direction");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus exporter.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Follow session lifecycle events until the registry goes away.
pub async fn track_sessions(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Opened(details)) => {
                counter!(names::SESSIONS_TOTAL, "realm" => details.realm.clone()).increment(1);
                gauge!(names::SESSIONS_ACTIVE).increment(1.0);
            }
            Ok(SessionEvent::Closed(_)) => {
                gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session metrics lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Session metrics stopped");
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::SessionRegistry;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op
        let _guard = ConnectionMetricsGuard::new();
        record_frame(10, "inbound");
        record_error("websocket");
    }

    #[tokio::test]
    async fn test_track_sessions_ends_with_registry() {
        let registry = SessionRegistry::new();
        let task = tokio::spawn(track_sessions(registry.subscribe_events()));
        drop(registry);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
