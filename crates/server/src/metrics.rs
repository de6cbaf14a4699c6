//! Application metrics for Prometheus monitoring.
//!
//! This module provides:
//! - Prometheus metrics recorder initialization
//! - Metric descriptions for the watcher, bus, gateway and index refresh
//! - Rendering for the `/metrics` endpoint

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// This should be called once at application startup, before any metrics are recorded.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!(
        "watcher_notifications_total",
        "Classified file notifications received by the directory watcher"
    );
    describe_counter!(
        "watcher_events_emitted_total",
        "Change events emitted after debouncing, by kind"
    );
    describe_counter!(
        "watcher_dropped_notifications_total",
        "Raw notifications dropped because the watcher channel was full"
    );
    describe_counter!(
        "event_bus_dropped_total",
        "Events dropped because a listener queue was full, by kind"
    );
    describe_histogram!(
        "index_refresh_duration_seconds",
        "Duration of incremental index refreshes in seconds"
    );
    describe_gauge!("gateway_subscribers", "Connected push-stream subscribers");
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Record a completed index refresh.
pub fn record_refresh(duration: Duration, changed: usize, removed: usize, full_reload: bool) {
    histogram!("index_refresh_duration_seconds").record(duration.as_secs_f64());

    if full_reload || changed > 0 || removed > 0 {
        tracing::debug!(
            duration_ms = duration.as_millis() as u64,
            changed,
            removed,
            full_reload,
            "Index refresh applied changes"
        );
    }
}
