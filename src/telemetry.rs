//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded through the `metrics` crate's macros, mostly by the
//! temporal manager on its tick. This module installs the Prometheus
//! exporter, registers human-readable descriptions, and builds the scrape
//! router.

use axum::routing::get;
use axum::Router;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still
/// works; the `metrics` macros route to whichever recorder was installed
/// first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving `GET /metrics` in the Prometheus exposition format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

fn describe() {
    describe_gauge!(
        "slotmux_slots_idle",
        "Idle inference slots across all registered targets"
    );
    describe_gauge!(
        "slotmux_slots_processing",
        "Occupied inference slots across all registered targets"
    );
    describe_gauge!(
        "slotmux_targets_registered",
        "Targets currently registered with the balancer"
    );
    describe_gauge!(
        "slotmux_buffered_requests",
        "Requests currently parked in the admission buffer"
    );
    describe_counter!(
        "slotmux_requests_buffered_total",
        "Total requests that entered the admission buffer"
    );
    describe_counter!(
        "slotmux_targets_evicted_total",
        "Targets evicted after their liveness countdown expired"
    );
}
