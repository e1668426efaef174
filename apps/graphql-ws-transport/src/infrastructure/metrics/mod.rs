//! Prometheus Metrics Module
//!
//! Transport metrics recorded through the `metrics` facade. Recording is a
//! no-op until a recorder is installed, so library users pay nothing unless
//! they call [`init_metrics`] or install their own recorder.
//!
//! # Metrics
//!
//! - `graphql_ws_frames_sent_total{frame}`: frames written to the socket
//! - `graphql_ws_frames_received_total{frame}`: frames decoded from the socket
//! - `graphql_ws_frames_dropped_total{reason}`: inbound frames not delivered
//! - `graphql_ws_reconnects_total`: reconnection attempts
//! - `graphql_ws_connect_failures_total`: failed on-demand connection attempts
//! - `graphql_ws_active_subscriptions`: live upstream operations
//! - `graphql_ws_connection_state`: numeric connection state

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, once per process.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "graphql_ws_frames_sent_total",
        "Total protocol frames written to the socket"
    );
    describe_counter!(
        "graphql_ws_frames_received_total",
        "Total protocol frames decoded from the socket"
    );
    describe_counter!(
        "graphql_ws_frames_dropped_total",
        "Total inbound frames that were not delivered to any listener"
    );
    describe_counter!(
        "graphql_ws_reconnects_total",
        "Total reconnection attempts after connection loss"
    );
    describe_counter!(
        "graphql_ws_connect_failures_total",
        "Total failed on-demand connection attempts"
    );
    describe_gauge!(
        "graphql_ws_active_subscriptions",
        "Number of live upstream subscription operations"
    );
    describe_gauge!(
        "graphql_ws_connection_state",
        "Connection state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting, 4 faulted, 5 disposed)"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame written to the socket.
pub fn record_frame_sent(frame: &'static str) {
    counter!("graphql_ws_frames_sent_total", "frame" => frame).increment(1);
}

/// Record a frame decoded from the socket.
pub fn record_frame_received(frame: &'static str) {
    counter!("graphql_ws_frames_received_total", "frame" => frame).increment(1);
}

/// Record an inbound frame that reached no listener.
pub fn record_frame_dropped(reason: &'static str) {
    counter!("graphql_ws_frames_dropped_total", "reason" => reason).increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("graphql_ws_reconnects_total").increment(1);
}

/// Record a failed on-demand connection attempt.
pub fn record_connect_failure() {
    counter!("graphql_ws_connect_failures_total").increment(1);
}

/// Update the number of live operations.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("graphql_ws_active_subscriptions").set(count as f64);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("graphql_ws_connection_state").set(state.as_gauge());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_sent("start");
        record_frame_received("data");
        record_frame_dropped("unknown_operation");
        record_reconnect();
        record_connect_failure();
        set_active_subscriptions(3);
        set_connection_state(ConnectionState::Connected);
    }

    #[test]
    fn init_is_idempotent_and_renders() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();

        record_frame_sent("stop");
        set_connection_state(ConnectionState::Faulted);

        let rendered = second.render();
        assert!(rendered.contains("graphql_ws_frames_sent_total"));
        assert!(rendered.contains("graphql_ws_connection_state"));
        assert!(!first.render().is_empty());
        assert!(get_metrics_handle().is_some());
    }
}
