// src/config/sources.rs
//! Static per-source configuration: descriptors, endpoints, decoders,
//! rate-limit policies and the domain areas the endpoints feed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}
fn default_priority() -> u8 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_area_weight() -> f64 {
    1.0
}

/// Cache category. Each tier maps to a TTL (overridable in `[cache.tiers]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    Realtime,
    Frequent,
    #[default]
    Hourly,
    Daily,
    Static,
}

/// TTL per cache tier, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTtls {
    pub realtime_secs: u64,
    pub frequent_secs: u64,
    pub hourly_secs: u64,
    pub daily_secs: u64,
    pub static_secs: u64,
}

impl Default for TierTtls {
    fn default() -> Self {
        Self {
            realtime_secs: 5 * 60,
            frequent_secs: 15 * 60,
            hourly_secs: 3600,
            daily_secs: 24 * 3600,
            static_secs: 7 * 24 * 3600,
        }
    }
}

impl TierTtls {
    pub fn ttl_for(&self, tier: TtlTier) -> Duration {
        let secs = match tier {
            TtlTier::Realtime => self.realtime_secs,
            TtlTier::Frequent => self.frequent_secs,
            TtlTier::Hourly => self.hourly_secs,
            TtlTier::Daily => self.daily_secs,
            TtlTier::Static => self.static_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Per-source admission policy for the rate limit gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub max_concurrent: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_ceiling_ms: u64,
    /// Waiters beyond this bound fail fast with `RateLimited`.
    pub max_queue: usize,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_per_minute: 30,
            max_per_hour: 600,
            max_concurrent: 2,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 60_000,
            max_queue: 32,
        }
    }
}

impl RateLimitPolicy {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    /// Clamp nonsensical values instead of rejecting the whole config.
    pub(crate) fn sanitize(&mut self) {
        self.max_per_minute = self.max_per_minute.max(1);
        self.max_per_hour = self.max_per_hour.max(self.max_per_minute);
        self.max_concurrent = self.max_concurrent.max(1);
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            self.backoff_multiplier = 1.0;
        }
        if self.backoff_ceiling_ms < self.backoff_base_ms {
            self.backoff_ceiling_ms = self.backoff_base_ms;
        }
        self.max_queue = self.max_queue.max(1);
    }
}

/// How to turn an endpoint's raw bytes into observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderSpec {
    /// JSON array of flat objects, one row per date.
    /// `fields` empty = every numeric member except the date.
    JsonRows {
        date_field: String,
        #[serde(default)]
        fields: Vec<String>,
        /// Optional dotted path to the array inside a wrapper object.
        #[serde(default)]
        array_path: Option<String>,
    },
    /// World Bank v2 indicator response: `[meta, [ {indicator, date, value} ]]`.
    WorldBank,
    /// CSV with a header row.
    Csv(TableLayout),
    /// First worksheet of an XLSX workbook, header in the first row.
    Xlsx(TableLayout),
}

/// Column layout shared by the tabular decoders.
///
/// Wide layout: one column per metric (`value_columns`).
/// Long layout: a metric-name column plus a single value column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub date_column: String,
    #[serde(default)]
    pub value_columns: Vec<String>,
    #[serde(default)]
    pub metric_column: Option<String>,
    #[serde(default)]
    pub value_column: Option<String>,
}

/// One upstream endpoint and the domain area it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Relative to the source base URL, or an absolute URL.
    pub path: String,
    pub area: String,
    pub decoder: DecoderSpec,
}

/// Static configuration of one upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower number = served first.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub cache_tier: TtlTier,
    /// Explicit TTL; wins over `cache_tier`.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl SourceDescriptor {
    pub fn ttl(&self, tiers: &TierTtls) -> Duration {
        match self.ttl_secs {
            Some(secs) => Duration::from_secs(secs.max(1)),
            None => tiers.ttl_for(self.cache_tier),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Full URL for an endpoint path (absolute paths pass through).
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// How contributions to one area are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Sum values per metric and date across sources.
    Sum,
    /// Keep only the most recent point per metric.
    Latest,
    /// Keep every point; conflicts go to the best-ranked source.
    #[default]
    Union,
}

/// A named slice of the consolidated snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSpec {
    pub key: String,
    #[serde(default)]
    pub merge: MergeStrategy,
    #[serde(default)]
    pub expected_metrics: Vec<String>,
    /// Weight of this area in the overall quality score.
    #[serde(default = "default_area_weight")]
    pub weight: f64,
}
