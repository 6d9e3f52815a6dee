//! Metrics collection and exposition.
//!
//! # Metrics
//! - `dispatch_routes_total` (counter): routing decisions by outcome
//! - `dispatch_route_duration_seconds` (histogram): selection latency
//! - `dispatch_backend_health` (gauge): 1=healthy, 0=unhealthy
//! - `dispatch_backend_connections` (gauge): in-flight requests per backend
//! - `dispatch_probe_duration_seconds` (histogram): probe latency by outcome
//!
//! Recording is a no-op until a recorder is installed, so the core can be
//! used (and tested) without the exporter.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_route(outcome: &'static str, start: Instant) {
    ::metrics::counter!("dispatch_routes_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!("dispatch_route_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    ::metrics::gauge!("dispatch_backend_health", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_backend_connections(backend: &str, connections: u64) {
    ::metrics::gauge!("dispatch_backend_connections", "backend" => backend.to_string())
        .set(connections as f64);
}

pub fn record_probe(backend: &str, success: bool, latency: Option<Duration>) {
    let outcome = if success { "success" } else { "failure" };
    ::metrics::histogram!(
        "dispatch_probe_duration_seconds",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .record(latency.map(|l| l.as_secs_f64()).unwrap_or(0.0));
}
