//! Process-wide Prometheus registry.
//!
//! Installed once at startup; the hot path only touches counter increments
//! and timer observations.

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(
        "http_requests_total",
        "HTTP requests by method, route and status"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "End-to-end HTTP request latency"
    );
    describe_counter!("trades_total", "Executed trades by side");
    describe_histogram!(
        "trade_duration_seconds",
        Unit::Seconds,
        "Trade pipeline latency including the writer-lock wait"
    );
    describe_gauge!("active_markets", "Markets created by this process");
    describe_gauge!("ws_subscribers", "Connected live subscribers");
    describe_counter!(
        "position_limit_rejections_total",
        "Trades rejected by the correlation limiter"
    );
    describe_gauge!(
        "market_volume_total",
        "Cumulative traded share volume per contract"
    );
    describe_counter!(
        "ws_messages_dropped_total",
        "Price updates dropped because a queue was full"
    );
}
