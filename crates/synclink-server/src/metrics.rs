//! Metrics collection and export for Synclink.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use synclink_core::HubStats;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "synclink_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "synclink_connections_active";
    pub const USERS_CONNECTED: &str = "synclink_users_connected";
    pub const FRAMES_TOTAL: &str = "synclink_frames_total";
    pub const SLOW_CONSUMER_DROPS: &str = "synclink_slow_consumer_drops_total";
    pub const DEVICES_ONLINE: &str = "synclink_devices_online";
    pub const DEVICES_ACTIVE_TODAY: &str = "synclink_devices_active_today";
    pub const BRIDGE_CONNECTED: &str = "synclink_bridge_connected";
    pub const BRIDGE_RECONNECTS: &str = "synclink_bridge_reconnects_total";
    pub const SYNC_REQUESTS: &str = "synclink_sync_requests_total";
    pub const SYNC_SECONDS: &str = "synclink_sync_seconds";
    pub const ERRORS_TOTAL: &str = "synclink_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of device connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open device connections"
    );
    metrics::describe_gauge!(names::USERS_CONNECTED, "Users with at least one open connection");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames moved over device sockets");
    metrics::describe_counter!(
        names::SLOW_CONSUMER_DROPS,
        "Frames dropped because a device's outbound queue was full"
    );
    metrics::describe_gauge!(names::DEVICES_ONLINE, "Devices currently online");
    metrics::describe_gauge!(names::DEVICES_ACTIVE_TODAY, "Devices seen since midnight UTC");
    metrics::describe_gauge!(names::BRIDGE_CONNECTED, "1 while the bus link is up");
    metrics::describe_counter!(names::BRIDGE_RECONNECTS, "Bus reconnections");
    metrics::describe_counter!(names::SYNC_REQUESTS, "Catch-up requests served over HTTP");
    metrics::describe_histogram!(names::SYNC_SECONDS, "Catch-up request latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
}

/// Record a catch-up request and its latency.
pub fn record_sync(seconds: f64, outcome: &'static str) {
    counter!(names::SYNC_REQUESTS, "outcome" => outcome).increment(1);
    histogram!(names::SYNC_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish a hub snapshot.
pub fn record_hub(stats: &HubStats) {
    gauge!(names::CONNECTIONS_ACTIVE).set(stats.connections as f64);
    gauge!(names::USERS_CONNECTED).set(stats.users as f64);
    counter!(names::FRAMES_TOTAL, "direction" => "outbound").absolute(stats.frames_sent);
    counter!(names::FRAMES_TOTAL, "direction" => "inbound").absolute(stats.frames_received);
    counter!(names::SLOW_CONSUMER_DROPS).absolute(stats.slow_consumer_drops);
}

/// Publish presence counts.
pub fn record_presence(online: usize, active_today: usize) {
    gauge!(names::DEVICES_ONLINE).set(online as f64);
    gauge!(names::DEVICES_ACTIVE_TODAY).set(active_today as f64);
}

/// Publish bridge state.
pub fn record_bridge(connected: bool, reconnects: u64) {
    gauge!(names::BRIDGE_CONNECTED).set(if connected { 1.0 } else { 0.0 });
    counter!(names::BRIDGE_RECONNECTS).absolute(reconnects);
}
