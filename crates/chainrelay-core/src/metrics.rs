//! Prometheus metrics helpers for the chainrelay pipeline.
//!
//! Provides centralized recorder initialization and the metric descriptions
//! shared across components.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`session_`, `decode_`, `relay_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: used sparingly (`kind` for the four record kinds)

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded. Returns a
/// handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    register_common_metrics();
    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed. Useful in tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Serve the `/metrics` endpoint on the given port.
///
/// Spawns a background task and returns immediately.
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
            tracing::error!("metrics server exited: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // Session
    describe_counter!("session_frames_total", "Frames received from the feed");
    describe_counter!(
        "session_frames_dropped_total",
        "Frames skipped (non-binary, unparseable, or unknown kind)"
    );
    describe_counter!("session_bytes_total", "Raw frame bytes received");
    describe_gauge!("session_in_flight", "Decode tasks currently in flight");
    describe_gauge!("session_watermark", "Highest block acknowledged upstream");

    // Decode engine
    describe_counter!(
        "decode_records_total",
        "Records produced by the decoders (label: kind)"
    );
    describe_counter!(
        "decode_errors_total",
        "Per-record decode failures (record dropped, pipeline continues)"
    );
    describe_counter!(
        "decode_quality_faults_total",
        "Data-quality degradations (missing ABI, placeholder block id, ...)"
    );

    // Durable relay
    describe_counter!(
        "relay_enqueued_total",
        "Records written to the durable queues (label: kind)"
    );
    describe_counter!(
        "relay_published_total",
        "Records published to the bus (label: kind)"
    );
    describe_counter!(
        "relay_publish_bytes_total",
        "Compressed bytes published to the bus"
    );
    describe_gauge!(
        "relay_queue_depth",
        "Entries waiting in a durable queue (label: kind)"
    );
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
    fn try_init_metrics_is_idempotent() {
        let first = try_init_metrics();
        let second = try_init_metrics();
        assert!(first.is_none() || second.is_none());
    }

    #[test]
    fn register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
