//! Humanitarian data core: binary entrypoint.
//! Boots the Axum operator surface, restores persisted state and starts
//! the refresh loop.

use shuttle_axum::ShuttleAxum;

use humdata_core::metrics::Metrics;
use humdata_core::{app, telemetry};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    if !telemetry::init() {
        tracing::debug!("tracing subscriber already installed by the runtime");
    }

    let (core, mut router) = app().await?;

    match Metrics::init() {
        Ok(metrics) => router = router.merge(metrics.router()),
        Err(err) => tracing::warn!(error = ?err, "metrics disabled"),
    }

    let startup = core.clone();
    tokio::spawn(async move {
        let status = startup.startup_refresh().await;
        tracing::info!(
            target: "scheduler",
            outcome = ?status.last_outcome,
            version = status.snapshot_version,
            "startup refresh done"
        );
    });
    if !core.start_auto_refresh() {
        tracing::info!(target: "scheduler", "auto-refresh disabled (interval_secs = 0)");
    }

    Ok(router.into())
}
