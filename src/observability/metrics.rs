//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define aggregator metrics (requests, cache, circuits, pools, reloads)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `aggregator_requests_total` (counter): requests by method, outcome, backend
//! - `aggregator_request_duration_seconds` (histogram): end-to-end latency
//! - `aggregator_cache_operations_total` (counter): hit_exact, hit_content, miss, coalesced
//! - `aggregator_backend_circuit_state` (gauge): 0=closed, 1=open, 2=half_open
//! - `aggregator_circuit_transitions_total` (counter): transitions by backend, state
//! - `aggregator_pool_acquire_total` (counter): acquisitions by backend, result
//! - `aggregator_reloads_total` (counter): reloads by result
//! - `aggregator_generation` (gauge): current generation version
//!
//! # Design Decisions
//! - Callers go through the functions below, never the macros directly
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::health::state::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, outcome: &str, backend: &str, elapsed: Duration) {
    counter!(
        "aggregator_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string(),
        "backend" => backend.to_string()
    )
    .increment(1);
    histogram!("aggregator_request_duration_seconds", "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_cache(result: &'static str) {
    counter!("aggregator_cache_operations_total", "result" => result).increment(1);
}

pub fn record_circuit_transition(backend: &str, state: CircuitState) {
    gauge!("aggregator_backend_circuit_state", "backend" => backend.to_string()).set(state as u8 as f64);
    counter!(
        "aggregator_circuit_transitions_total",
        "backend" => backend.to_string(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_pool_acquire(backend: &str, result: &'static str) {
    counter!(
        "aggregator_pool_acquire_total",
        "backend" => backend.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_reload(result: &'static str) {
    counter!("aggregator_reloads_total", "result" => result).increment(1);
}

pub fn record_generation(version: u64) {
    gauge!("aggregator_generation").set(version as f64);
}
