//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (RPS, latency, failovers, connections)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-backend and per-listener metrics
//!
//! # Metrics
//! - `edge_requests_total` (counter): requests by host, status
//! - `edge_request_duration_seconds` (histogram): latency distribution
//! - `edge_backend_alive` (gauge): 1=alive, 0=dead
//! - `edge_backend_failovers_total` (counter): transport failures by backend
//! - `edge_rate_limited_total` (counter): rejected requests
//! - `edge_connections` (gauge): tracked connections by listener, state
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record a completed request.
pub fn record_request(host: &str, status: u16, start: Instant) {
    let host = if host.is_empty() { "-" } else { host }.to_string();
    counter!("edge_requests_total", "host" => host.clone(), "status" => status.to_string())
        .increment(1);
    histogram!("edge_request_duration_seconds", "host" => host)
        .record(start.elapsed().as_secs_f64());
}

/// Record the latest liveness of a backend.
pub fn record_backend_health(backend: &str, alive: bool) {
    gauge!("edge_backend_alive", "backend" => backend.to_string())
        .set(if alive { 1.0 } else { 0.0 });
}

/// Record a transport failure that moved a request to another backend.
pub fn record_failover(backend: &str) {
    counter!("edge_backend_failovers_total", "backend" => backend.to_string()).increment(1);
}

/// Record a request rejected by the rate limiter.
pub fn record_rate_limited() {
    counter!("edge_rate_limited_total").increment(1);
}

/// Publish the tracked connection counts of a listener.
pub fn set_connections(listener: &str, active: usize, idle: usize) {
    gauge!("edge_connections", "listener" => listener.to_string(), "state" => "active")
        .set(active as f64);
    gauge!("edge_connections", "listener" => listener.to_string(), "state" => "idle")
        .set(idle as f64);
}
