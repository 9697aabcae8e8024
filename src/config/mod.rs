// src/config/mod.rs
//! Core configuration, loaded from TOML.
//!
//! Lookup order for [`CoreConfig::load_default`]:
//! 1) `$HUMDATA_CONFIG_PATH`
//! 2) `config/sources.toml`
//! 3) built-in defaults (no sources, no areas)

pub mod sources;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub use sources::{
    AreaSpec, DecoderSpec, EndpointSpec, MergeStrategy, RateLimitPolicy, SourceDescriptor,
    TableLayout, TierTtls, TtlTier,
};

pub const ENV_CONFIG_PATH: &str = "HUMDATA_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/sources.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceThresholds,
    pub quality: QualityPolicy,
    pub registry: RegistryConfig,
    pub sources: Vec<SourceDescriptor>,
    pub areas: Vec<AreaSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Auto-refresh interval; 0 disables the timer.
    pub interval_secs: u64,
    /// Window-focus refreshes are skipped while the last success is younger.
    pub focus_min_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            focus_min_interval_secs: 5 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn focus_min_interval(&self) -> Duration {
        Duration::from_secs(self.focus_min_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Hard per-call timeout, independent of retries.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest a caller waits for rate-limit admission before `RateLimited`.
    pub max_wait_ms: u64,
    /// Random extra delay on top of each retry backoff, as a fraction of it.
    pub jitter_ratio: f64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 12_000,
            connect_timeout_ms: 4_000,
            max_wait_ms: 30_000,
            jitter_ratio: 0.2,
            user_agent: concat!(
                "humdata-core/",
                env!("CARGO_PKG_VERSION"),
                " (+humanitarian data dashboard)"
            )
            .to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tiers: TierTtls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the file-backed blob store.
    pub dir: PathBuf,
    /// Snapshot versions kept besides `snapshot/latest`.
    pub snapshot_history: usize,
    /// Write cache entries through to the blob store.
    pub persist_cache: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state/humdata"),
            snapshot_history: 3,
            persist_cache: true,
        }
    }
}

/// Alert thresholds for the performance tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub avg_latency_warn_ms: f64,
    pub p95_critical_ms: f64,
    pub min_success_rate: f64,
    /// Latest-window average vs. prior-window average.
    pub degradation_factor: f64,
    /// Samples per comparison window for degradation detection.
    pub degradation_window: usize,
    /// No alert is evaluated below this many samples.
    pub min_samples: usize,
    /// Samples kept per source.
    pub max_samples: usize,
    pub retention_secs: u64,
    /// Same (source, condition) does not re-fire inside this window.
    pub alert_cooldown_secs: u64,
    pub max_alerts: usize,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            avg_latency_warn_ms: 3_000.0,
            p95_critical_ms: 8_000.0,
            min_success_rate: 0.95,
            degradation_factor: 2.0,
            degradation_window: 10,
            min_samples: 5,
            max_samples: 500,
            retention_secs: 24 * 3600,
            alert_cooldown_secs: 15 * 60,
            max_alerts: 200,
        }
    }
}

/// Weights of the per-area quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub freshness: f64,
    pub recency: f64,
    pub completeness: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            freshness: 0.5,
            recency: 0.2,
            completeness: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    pub weights: QualityWeights,
    /// Credit of a stale fallback contribution (live/cached = 1, error = 0).
    pub fallback_credit: f64,
    /// Data retrieved within this age gets full recency credit.
    pub recency_full_secs: u64,
    /// Data older than this gets none.
    pub recency_zero_secs: u64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            fallback_credit: 0.5,
            recency_full_secs: 3600,
            recency_zero_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Disable a source after this many consecutive failed fetches (0 = never).
    pub auto_disable_after: u32,
}

impl CoreConfig {
    /// Load from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load using env var + fallbacks (see module docs).
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        tracing::warn!(path = DEFAULT_CONFIG_PATH, "no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: CoreConfig = toml::from_str(s)?;
        cfg.sanitize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Clamp values that have an obvious safe replacement.
    pub fn sanitize(&mut self) {
        for src in &mut self.sources {
            src.max_attempts = src.max_attempts.max(1);
            src.rate_limit.sanitize();
        }
        if !(0.0..=1.0).contains(&self.fetch.jitter_ratio) {
            self.fetch.jitter_ratio = FetchConfig::default().jitter_ratio;
        }
        let q = &mut self.quality;
        for w in [
            &mut q.weights.freshness,
            &mut q.weights.recency,
            &mut q.weights.completeness,
        ] {
            if !w.is_finite() || *w < 0.0 {
                *w = 0.0;
            }
        }
        if q.weights.freshness + q.weights.recency + q.weights.completeness <= 0.0 {
            q.weights = QualityWeights::default();
        }
        q.fallback_credit = q.fallback_credit.clamp(0.0, 1.0);
        if q.recency_zero_secs <= q.recency_full_secs {
            q.recency_zero_secs = q.recency_full_secs + 1;
        }
        for area in &mut self.areas {
            if !area.weight.is_finite() || area.weight < 0.0 {
                area.weight = 0.0;
            }
        }
        let p = &mut self.performance;
        p.min_success_rate = p.min_success_rate.clamp(0.0, 1.0);
        p.degradation_window = p.degradation_window.max(1);
        p.max_samples = p.max_samples.max(p.degradation_window * 2);
        p.max_alerts = p.max_alerts.max(1);
    }

    /// Reject configs that cannot be interpreted.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for src in &self.sources {
            if src.id.trim().is_empty() {
                bail!("source with empty id");
            }
            if !ids.insert(src.id.as_str()) {
                bail!("duplicate source id: {}", src.id);
            }
        }

        let mut areas = HashSet::new();
        for area in &self.areas {
            if !areas.insert(area.key.as_str()) {
                bail!("duplicate area key: {}", area.key);
            }
        }

        for src in &self.sources {
            let mut paths = HashSet::new();
            for ep in &src.endpoints {
                if !areas.contains(ep.area.as_str()) {
                    bail!(
                        "endpoint {} of source {} feeds unknown area {}",
                        ep.path,
                        src.id,
                        ep.area
                    );
                }
                if !paths.insert(ep.path.as_str()) {
                    bail!("duplicate endpoint {} in source {}", ep.path, src.id);
                }
                if let DecoderSpec::Csv(t) | DecoderSpec::Xlsx(t) = &ep.decoder {
                    let long = t.metric_column.is_some() && t.value_column.is_some();
                    if !long && t.value_columns.is_empty() {
                        bail!(
                            "endpoint {} of source {}: table decoder needs value_columns or metric_column + value_column",
                            ep.path,
                            src.id
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn area(&self, key: &str) -> Option<&AreaSpec> {
        self.areas.iter().find(|a| a.key == key)
    }
}
