// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;

// Source plumbing
pub mod cache;
pub mod decode;
pub mod fetcher;
pub mod perf;
pub mod rate_limit;
pub mod registry;
pub mod transport;

// Persistence
pub mod persist;
pub mod store;

// Consolidation & refresh
pub mod consolidate;
pub mod merge;
pub mod quality;
pub mod scheduler;
pub mod status;

pub mod api;
pub mod metrics;
pub mod service;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::CoreConfig;
pub use crate::consolidate::{ConsolidatedSnapshot, RefreshOptions};
pub use crate::error::{ConsolidationError, FetchError};
pub use crate::service::DashboardCore;
pub use crate::status::{RefreshStatus, Subscription};

use std::sync::Arc;

use anyhow::Result;

/// Build the full in-process app from the default config: bootstrap the
/// core from storage and return it with its router (without `/metrics`).
pub async fn app() -> Result<(Arc<DashboardCore>, axum::Router)> {
    let config = CoreConfig::load_default()?;
    let core = Arc::new(DashboardCore::from_config(config).await?);
    if let Err(err) = core.bootstrap().await {
        tracing::warn!(target: "persist", error = ?err, "bootstrap failed, starting empty");
    }
    let router = router(AppState::new(core.clone()));
    Ok((core, router))
}
