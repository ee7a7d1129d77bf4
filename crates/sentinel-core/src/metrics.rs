//! Prometheus metrics helpers for the Sentinel relay.
//!
//! The persistent counters in the counter store are the pipeline's own
//! audit numbers; these Prometheus metrics are process-local and reset on
//! restart. They exist for dashboards and alerting on the relay process.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sentinel_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("relay_messages_total", "stage" => "zdns_4hr").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`relay_`, `store_`, `broker_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `stage` only, stage names are a small fixed set

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    try_init_metrics().expect("Failed to install Prometheus recorder")
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_relay_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` and serves `/metrics` from a background task.
/// Bind failures are returned; serve failures after that are logged.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the relay's metrics.
fn register_relay_metrics() {
    // =========================================================================
    // Relay stages
    // =========================================================================

    describe_counter!(
        "relay_messages_total",
        "Inbound messages handled by a stage (label: stage)"
    );
    describe_counter!(
        "relay_decode_errors_total",
        "Inbound messages dropped because they failed to decode (label: stage)"
    );
    describe_counter!(
        "relay_records_published_total",
        "Derived records published downstream (label: stage)"
    );
    describe_counter!(
        "relay_publish_errors_total",
        "Derived records that could not be encoded or published (label: stage)"
    );
    describe_counter!(
        "relay_observation_errors_total",
        "Counter or result log writes that failed (label: stage)"
    );
    describe_histogram!(
        "relay_message_duration_seconds",
        "Time spent processing one inbound message (label: stage)"
    );
    describe_gauge!("relay_running", "1 while the relay daemon is up");
    describe_gauge!(
        "relay_stages_running",
        "Number of relay stages currently consuming"
    );

    // =========================================================================
    // Broker
    // =========================================================================

    describe_counter!(
        "broker_reconnects_total",
        "Broker connections re-established after a failure"
    );
}

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 5);
        set_gauge("test_gauge", 1.0);
        set_gauge("test_gauge", -3.5);
    }

    #[test]
    fn test_register_relay_metrics_is_repeatable() {
        ensure_metrics_init();
        register_relay_metrics();
        register_relay_metrics();
    }
}
