//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): finished requests by status, outcome
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_body_bytes_total` (counter): relayed body bytes by framing
//! - `proxy_tunnels_total` (counter): SOCKS handshakes by result
//! - `proxy_buffer_segments_live` (gauge): reserved output segments
//! - `proxy_backpressure_total` (counter): ingest stalls on the pool ceiling
//! - `proxy_active_connections` (gauge): current client connections
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op
//! - Histogram buckets tuned for typical web latencies

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .install()?;

    describe();
    tracing::info!(address = %addr, "Prometheus metrics endpoint started");
    Ok(())
}

fn describe() {
    describe_counter!("proxy_requests_total", "Finished proxied requests");
    describe_histogram!(
        "proxy_request_duration_seconds",
        Unit::Seconds,
        "Time from accept to the last byte written"
    );
    describe_counter!("proxy_body_bytes_total", Unit::Bytes, "Relayed response body bytes");
    describe_counter!("proxy_tunnels_total", "SOCKS tunnel handshakes");
    describe_gauge!("proxy_buffer_segments_live", "Output segments currently reserved");
    describe_counter!("proxy_backpressure_total", "Ingest stalls on the buffer ceiling");
    describe_gauge!("proxy_active_connections", "Open client connections");
}

pub fn record_request(status: u16, outcome: &'static str, start: Instant) {
    counter!("proxy_requests_total", "status" => status.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_body_bytes(framing: &'static str, bytes: u64) {
    counter!("proxy_body_bytes_total", "framing" => framing).increment(bytes);
}

pub fn record_tunnel(result: &'static str) {
    counter!("proxy_tunnels_total", "result" => result).increment(1);
}

pub fn record_segments_live(live: usize) {
    gauge!("proxy_buffer_segments_live").set(live as f64);
}

pub fn record_backpressure() {
    counter!("proxy_backpressure_total").increment(1);
}

pub fn record_active_connections(active: u64) {
    gauge!("proxy_active_connections").set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_request(502, "upstream_protocol", Instant::now());
            record_tunnel("rejected");
            record_body_bytes("chunked", 42);
        });

        let rendered = handle.render();
        assert!(rendered.contains("proxy_requests_total{status=\"502\",outcome=\"upstream_protocol\"} 1"));
        assert!(rendered.contains("proxy_tunnels_total{result=\"rejected\"} 1"));
        assert!(rendered.contains("proxy_body_bytes_total{framing=\"chunked\"} 42"));
    }
}
