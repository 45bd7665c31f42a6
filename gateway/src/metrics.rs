//! Prometheus metrics registration, in the style of the teacher's
//! `GatewayMetrics::register_metrics` (`describe_counter!`/`describe_gauge!`/
//! `describe_histogram!` at startup), but actually wired to an installed
//! `PrometheusRecorder` so `GET /metrics` renders real exposition text
//! rather than a hand-written template.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_PUSH_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0];

/// Installs the global Prometheus recorder and describes every metric named
/// by this broker, returning a handle whose `render()` backs `GET /metrics`.
pub fn install() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("http_push_latency_seconds".to_string()),
            HTTP_PUSH_LATENCY_BUCKETS,
        )
        .expect("valid histogram buckets")
        .install_recorder()
        .expect("install global metrics recorder");

    describe_counter!("ws_connects_total", "Client WebSocket connections accepted");
    describe_counter!("ws_errors_total", "Client WebSocket transport errors and dropped frames");
    describe_counter!("bars_pushed_total", "Bars successfully delivered to the HTTP push sink");
    describe_counter!("recovery_attempts_total", "Individual subscription recovery attempts");
    describe_counter!("successful_recoveries_total", "Individual subscription recoveries that succeeded");
    describe_counter!("failed_recoveries_total", "Individual subscription recoveries that failed");
    describe_counter!("full_reconnects_total", "Full upstream reconnects performed");

    describe_gauge!("active_subscriptions", "Currently live upstream subscriptions");
    describe_gauge!("stale_subscriptions", "Subscriptions currently flagged stale by the health monitor");
    describe_gauge!("last_data_received_seconds", "Seconds since the last bar for a {symbol,timeframe}");

    describe_histogram!("http_push_latency_seconds", "Latency of each HTTP push sink attempt");

    handle
}
