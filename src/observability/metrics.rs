//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (connections, requests, latency, cache, pool)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter): connections handed to the pool
//! - `proxy_connections_rejected_total` (counter): connections dropped by the pool
//! - `proxy_accept_errors_total` (counter): failed `accept()` calls
//! - `proxy_requests_total` (counter): completed exchanges by method, status
//! - `proxy_request_duration_seconds` (histogram): exchange latency
//! - `proxy_cache_events_total` (counter): cache hit / miss / store
//! - `proxy_upstream_connects_total` (counter): upstream connections by reuse
//! - `proxy_pool_active` / `proxy_pool_queued` (gauges): worker pool occupancy
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are limited to low-cardinality values

use std::net::SocketAddr;
use std::time::Instant;

use http::Method;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_accepted() {
    counter!("proxy_connections_accepted_total").increment(1);
}

pub fn record_rejected() {
    counter!("proxy_connections_rejected_total").increment(1);
}

pub fn record_accept_error() {
    counter!("proxy_accept_errors_total").increment(1);
}

/// Record one finished exchange. `status` is 0 when nothing was sent.
pub fn record_request(method: &Method, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method_label(method),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// Standard methods keep their name; extension methods share one label.
fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::CONNECT => "CONNECT",
        Method::OPTIONS => "OPTIONS",
        Method::TRACE => "TRACE",
        Method::PATCH => "PATCH",
        _ => "other",
    }
}

/// `result` is one of `hit`, `miss`, `store`.
pub fn record_cache(result: &'static str) {
    counter!("proxy_cache_events_total", "result" => result).increment(1);
}

pub fn record_upstream_connect(reused: bool) {
    let reused = if reused { "true" } else { "false" };
    counter!("proxy_upstream_connects_total", "reused" => reused).increment(1);
}

pub fn record_pool(active: usize, queued: usize) {
    gauge!("proxy_pool_active").set(active as f64);
    gauge!("proxy_pool_queued").set(queued as f64);
}
