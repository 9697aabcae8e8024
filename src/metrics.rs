// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Register help text for every series the core emits. Idempotent.
pub fn describe_metrics() {
    DESCRIBED.get_or_init(|| {
        describe_counter!(
            "fetch_requests_total",
            "Upstream fetch attempts by source and outcome"
        );
        describe_counter!("cache_lookups_total", "Response cache lookups by state");
        describe_counter!(
            "rate_limited_total",
            "Requests rejected by the rate-limit gate"
        );
        describe_counter!(
            "consolidation_runs_total",
            "Consolidation runs by outcome"
        );
        describe_counter!("perf_alerts_total", "Performance alerts raised by level");
        describe_histogram!(
            "fetch_duration_ms",
            Unit::Milliseconds,
            "Upstream call latency"
        );
        describe_gauge!(
            "snapshot_data_quality",
            "Data quality score of the published snapshot"
        );
        describe_gauge!(
            "refresh_last_success_ts",
            Unit::Seconds,
            "Unix time of the last successful refresh"
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if another recorder
    /// is already installed in this process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe_metrics();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
