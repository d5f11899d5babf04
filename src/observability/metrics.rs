//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method and outcome
//! - `proxy_request_duration_seconds` (histogram): time from parse to close
//! - `proxy_cache_lookups_total` (counter): lookups by result (hit/miss/busy)
//! - `proxy_cache_stores_total` (counter): completed or abandoned cache writes
//! - `proxy_bytes_relayed_total` (counter): bytes sent to clients by source
//! - `proxy_upstream_errors_total` (counter): dial/read failures by kind
//! - `proxy_active_connections` (gauge): current client connection count
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op, so the exporter stays optional.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, outcome: &'static str, start: Instant) {
    metrics::counter!("proxy_requests_total", "method" => method.to_string(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(result: &'static str) {
    metrics::counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_store(result: &'static str) {
    metrics::counter!("proxy_cache_stores_total", "result" => result).increment(1);
}

pub fn record_bytes_relayed(source: &'static str, bytes: u64) {
    metrics::counter!("proxy_bytes_relayed_total", "source" => source).increment(bytes);
}

pub fn record_upstream_error(kind: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "kind" => kind).increment(1);
}

pub fn record_active_connections(count: u64) {
    metrics::gauge!("proxy_active_connections").set(count as f64);
}
