// src/service.rs
//! `DashboardCore`: the one object a dashboard (or the HTTP surface) talks
//! to. Owns every component and wires them together from a [`CoreConfig`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cache::ResponseCache;
use crate::config::CoreConfig;
use crate::consolidate::{
    ConsolidatedSnapshot, Consolidator, PartialUpdate, RefreshOptions, SnapshotCell,
};
use crate::decode::SourcePayload;
use crate::error::ConsolidationError;
use crate::fetcher::SourceFetcher;
use crate::perf::{Alert, PerformanceSummary, PerformanceTracker};
use crate::persist::Persistence;
use crate::rate_limit::{RateLimitGate, RateLimitStatus};
use crate::registry::{SourceHealth, SourceRegistry};
use crate::scheduler::RefreshScheduler;
use crate::status::{RefreshStatus, RefreshTrigger, StatusBoard, Subscription};
use crate::store::{BlobStore, FileStore};
use crate::transport::{HttpTransport, Transport};

/// What to drop from the response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheInvalidation {
    /// One exact `{source}:{endpoint}` key.
    Key(String),
    /// Every key starting with this, e.g. `"reliefweb:"`.
    Prefix(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub restored_snapshot: Option<u64>,
    pub cache_entries: usize,
}

pub struct DashboardCore {
    config: CoreConfig,
    registry: Arc<SourceRegistry>,
    gate: RateLimitGate,
    cache: Arc<ResponseCache<SourcePayload>>,
    tracker: Arc<PerformanceTracker>,
    persistence: Persistence,
    cell: Arc<SnapshotCell>,
    status: Arc<StatusBoard>,
    scheduler: RefreshScheduler,
}

impl DashboardCore {
    /// Wire a core around an explicit transport and blob store.
    pub fn new(
        mut config: CoreConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.sanitize();
        config.validate().context("invalid core config")?;

        let registry = Arc::new(SourceRegistry::new(
            config.sources.clone(),
            config.registry.auto_disable_after,
        ));
        let gate = RateLimitGate::new(
            config
                .sources
                .iter()
                .map(|s| (s.id.clone(), s.rate_limit.clone())),
        );
        let cache = Arc::new(ResponseCache::new());
        let tracker = Arc::new(PerformanceTracker::new(config.performance.clone()));
        let persistence = Persistence::new(store, config.storage.snapshot_history);

        let fetcher = Arc::new(SourceFetcher::new(
            registry.clone(),
            gate.clone(),
            cache.clone(),
            tracker.clone(),
            transport,
            config.storage.persist_cache.then(|| persistence.clone()),
            config.fetch.clone(),
            config.cache.tiers.clone(),
        ));
        let cell = Arc::new(SnapshotCell::new());
        let consolidator = Arc::new(Consolidator::new(
            fetcher,
            config.areas.clone(),
            config.quality.clone(),
            cell.clone(),
        ));
        let status = Arc::new(StatusBoard::new());
        let scheduler = RefreshScheduler::new(
            consolidator,
            status.clone(),
            Some(persistence.clone()),
            config.scheduler.focus_min_interval(),
        );

        tracing::info!(
            target: "scheduler",
            sources = config.sources.len(),
            areas = config.areas.len(),
            "dashboard core ready"
        );

        Ok(Self {
            config,
            registry,
            gate,
            cache,
            tracker,
            persistence,
            cell,
            status,
            scheduler,
        })
    }

    /// Production wiring: reqwest transport and a file store under
    /// `storage.dir`.
    pub async fn from_config(config: CoreConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.fetch)?;
        let store = FileStore::open(&config.storage.dir)
            .await
            .with_context(|| format!("opening store at {}", config.storage.dir.display()))?;
        Self::new(config, Arc::new(transport), Arc::new(store))
    }

    /// Restore the last persisted snapshot and cache entries. Unreadable
    /// blobs are discarded by the persistence layer.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        if let Some(snapshot) = self
            .persistence
            .load_latest_snapshot::<ConsolidatedSnapshot>()
            .await
            .context("loading persisted snapshot")?
        {
            let version = snapshot.version;
            let last_updated = snapshot.last_updated;
            if self.cell.restore(snapshot) {
                report.restored_snapshot = Some(version);
                self.status.update(|st| {
                    st.snapshot_version = version;
                    st.last_successful_refresh = last_updated;
                });
            }
        }

        for entry in self
            .persistence
            .load_cache_entries()
            .await
            .context("loading persisted cache")?
        {
            if self.registry.get(source_of(&entry.key)).is_none() {
                continue;
            }
            if self.cache.import(entry) {
                report.cache_entries += 1;
            }
        }

        tracing::info!(
            target: "persist",
            snapshot = ?report.restored_snapshot,
            cache_entries = report.cache_entries,
            "bootstrap finished"
        );
        Ok(report)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<ConsolidatedSnapshot> {
        self.cell.load()
    }

    pub fn refresh_status(&self) -> RefreshStatus {
        self.status.current()
    }

    pub fn subscribe_to_refresh<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&RefreshStatus) + Send + Sync + 'static,
    {
        self.scheduler.subscribe(cb)
    }

    pub fn watch_refresh(&self) -> watch::Receiver<RefreshStatus> {
        self.status.watch()
    }

    pub async fn refresh_now(&self, opts: RefreshOptions) -> RefreshStatus {
        self.scheduler.refresh_now(opts).await
    }

    /// Initial full refresh after bootstrap.
    pub async fn startup_refresh(&self) -> RefreshStatus {
        self.scheduler
            .refresh(RefreshTrigger::Startup, RefreshOptions::full())
            .await
    }

    /// Force-refresh one area and splice it into the published snapshot.
    pub async fn refresh_area(&self, area: &str) -> Result<PartialUpdate, ConsolidationError> {
        self.scheduler.refresh_area(area, true).await
    }

    pub fn performance_summary(&self, source: Option<&str>) -> PerformanceSummary {
        self.tracker.summary(source)
    }

    pub fn performance_summaries(&self) -> BTreeMap<String, PerformanceSummary> {
        self.tracker.summaries()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.tracker.alerts()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.tracker.active_alerts()
    }

    pub fn rate_limit_status(&self, source: &str) -> Option<RateLimitStatus> {
        self.gate.status(source)
    }

    pub fn source_health(&self) -> BTreeMap<String, SourceHealth> {
        self.registry.health_all()
    }

    /// Returns `false` for unknown sources.
    pub fn set_source_enabled(&self, source: &str, enabled: bool) -> bool {
        self.registry.set_enabled(source, enabled)
    }

    /// Drop matching cache entries, in memory and in the blob store.
    /// Returns how many in-memory entries went away.
    pub async fn invalidate_cache(&self, target: &CacheInvalidation) -> Result<usize> {
        let removed = match target {
            CacheInvalidation::Key(key) => {
                let hit = self.cache.invalidate(key);
                self.persistence.delete_cache_entry(key).await?;
                usize::from(hit)
            }
            CacheInvalidation::Prefix(prefix) => {
                let n = self.cache.invalidate_prefix(prefix);
                self.persistence.delete_cache_prefix(prefix).await?;
                n
            }
        };
        tracing::info!(target: "fetch", invalidation = ?target, removed, "cache invalidated");
        Ok(removed)
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        let removed = self.cache.clear_all();
        self.persistence.delete_cache_prefix("").await?;
        tracing::info!(target: "fetch", removed, "cache cleared");
        Ok(removed)
    }

    /// Start the configured interval timer. Returns `false` when the
    /// interval is 0 (auto-refresh off).
    pub fn start_auto_refresh(&self) -> bool {
        match self.config.scheduler.interval() {
            Some(interval) => {
                self.scheduler.start(interval);
                true
            }
            None => false,
        }
    }

    pub fn stop_auto_refresh(&self) {
        self.scheduler.stop();
    }

    pub fn auto_refresh_running(&self) -> bool {
        self.scheduler.is_started()
    }

    /// `None` when skipped because the data is recent.
    pub async fn on_focus(&self) -> Option<RefreshStatus> {
        self.scheduler.on_focus().await
    }

    pub async fn on_reconnect(&self) -> RefreshStatus {
        self.scheduler.on_reconnect().await
    }
}

fn source_of(cache_key: &str) -> &str {
    cache_key.split_once(':').map_or(cache_key, |(s, _)| s)
}
