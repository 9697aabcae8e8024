//! # Performance Tracker
//! Bounded per-source request samples, rolling aggregates and threshold
//! alerts.
//!
//! Every `record` re-evaluates the four alert conditions for that source.
//! A condition only fires on its inactive → active transition, and a
//! per-(source, condition) cooldown keeps a flapping condition from
//! re-firing. Recovery emits an `info` resolution alert.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::PerformanceThresholds;

/// One finished upstream call (one attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub source_id: String,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub success: bool,
    pub status: Option<u16>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub source_id: Option<String>,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// 1.0 when there are no samples.
    pub success_rate: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    HighAverageLatency,
    HighP95Latency,
    LowSuccessRate,
    Degradation,
}

impl AlertCondition {
    const ALL: [AlertCondition; 4] = [
        AlertCondition::HighAverageLatency,
        AlertCondition::HighP95Latency,
        AlertCondition::LowSuccessRate,
        AlertCondition::Degradation,
    ];

    fn level(&self) -> AlertLevel {
        match self {
            AlertCondition::HighAverageLatency | AlertCondition::Degradation => AlertLevel::Warning,
            AlertCondition::HighP95Latency | AlertCondition::LowSuccessRate => AlertLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: u64,
    pub source_id: String,
    pub condition: AlertCondition,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
    /// `true` on the info alert emitted when a condition clears.
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Clone)]
struct ActiveCondition {
    /// `false` when activation fell inside the cooldown and was not emitted.
    announced: bool,
    alert: Alert,
}

type ConditionKey = (String, AlertCondition);

#[derive(Debug, Default)]
struct Inner {
    samples: HashMap<String, VecDeque<Sample>>,
    active: HashMap<ConditionKey, ActiveCondition>,
    last_fired: HashMap<ConditionKey, Instant>,
    history: VecDeque<Alert>,
    next_id: u64,
}

#[derive(Debug)]
pub struct PerformanceTracker {
    thresholds: PerformanceThresholds,
    inner: Mutex<Inner>,
}

impl PerformanceTracker {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self {
            thresholds,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    /// Record one outcome; returns the alerts this call emitted.
    pub fn record(&self, outcome: &RequestOutcome) -> Vec<Alert> {
        let duration_ms = outcome.duration.as_secs_f64() * 1000.0;
        histogram!("fetch_duration_ms", "source" => outcome.source_id.clone()).record(duration_ms);

        let now = Instant::now();
        let mut inner = self.inner.lock();
        let samples = inner.samples.entry(outcome.source_id.clone()).or_default();
        samples.push_back(Sample {
            at: now,
            duration_ms,
            success: outcome.success,
        });
        prune(samples, now, &self.thresholds);

        let emitted = self.evaluate(&mut inner, &outcome.source_id, now);
        drop(inner);

        for alert in &emitted {
            counter!("perf_alerts_total", "level" => alert.level.as_str()).increment(1);
            match alert.level {
                AlertLevel::Info => {
                    tracing::info!(target: "perf", source = %alert.source_id, condition = ?alert.condition, "{}", alert.message)
                }
                _ => {
                    tracing::warn!(target: "perf", source = %alert.source_id, condition = ?alert.condition, level = alert.level.as_str(), "{}", alert.message)
                }
            }
        }
        emitted
    }

    /// Aggregate for one source, or across all sources for `None`.
    pub fn summary(&self, source_id: Option<&str>) -> PerformanceSummary {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        for samples in inner.samples.values_mut() {
            prune(samples, now, &self.thresholds);
        }
        let collected: Vec<Sample> = match source_id {
            Some(id) => inner
                .samples
                .get(id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
            None => inner.samples.values().flatten().copied().collect(),
        };
        drop(inner);

        let mut summary = summarize(&collected);
        summary.source_id = source_id.map(str::to_string);
        summary
    }

    pub fn summaries(&self) -> BTreeMap<String, PerformanceSummary> {
        let ids: Vec<String> = self.inner.lock().samples.keys().cloned().collect();
        ids.into_iter()
            .map(|id| {
                let s = self.summary(Some(&id));
                (id, s)
            })
            .collect()
    }

    /// Alert history, oldest first, bounded by `max_alerts`.
    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Conditions currently in force.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut out: Vec<Alert> = self
            .inner
            .lock()
            .active
            .values()
            .map(|a| a.alert.clone())
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    fn evaluate(&self, inner: &mut Inner, source_id: &str, now: Instant) -> Vec<Alert> {
        let t = &self.thresholds;
        let Some(samples) = inner.samples.get(source_id) else {
            return Vec::new();
        };
        if samples.len() < t.min_samples {
            return Vec::new();
        }
        let snapshot: Vec<Sample> = samples.iter().copied().collect();
        let stats = summarize(&snapshot);
        let degradation = degradation_ratio(&snapshot, t.degradation_window);

        let mut emitted = Vec::new();
        for condition in AlertCondition::ALL {
            let (firing, value, threshold, message) = match condition {
                AlertCondition::HighAverageLatency => (
                    stats.avg_ms > t.avg_latency_warn_ms,
                    stats.avg_ms,
                    t.avg_latency_warn_ms,
                    format!(
                        "{source_id}: average latency {:.0}ms above {:.0}ms",
                        stats.avg_ms, t.avg_latency_warn_ms
                    ),
                ),
                AlertCondition::HighP95Latency => (
                    stats.p95_ms > t.p95_critical_ms,
                    stats.p95_ms,
                    t.p95_critical_ms,
                    format!(
                        "{source_id}: p95 latency {:.0}ms above {:.0}ms",
                        stats.p95_ms, t.p95_critical_ms
                    ),
                ),
                AlertCondition::LowSuccessRate => (
                    stats.success_rate < t.min_success_rate,
                    stats.success_rate,
                    t.min_success_rate,
                    format!(
                        "{source_id}: success rate {:.1}% below {:.1}%",
                        stats.success_rate * 100.0,
                        t.min_success_rate * 100.0
                    ),
                ),
                AlertCondition::Degradation => {
                    let ratio = degradation.unwrap_or(0.0);
                    (
                        degradation.is_some_and(|r| r >= t.degradation_factor),
                        ratio,
                        t.degradation_factor,
                        format!(
                            "{source_id}: latency {ratio:.1}x the previous window"
                        ),
                    )
                }
            };

            let key = (source_id.to_string(), condition);
            match (firing, inner.active.contains_key(&key)) {
                (true, false) => {
                    let cooled = inner.last_fired.get(&key).map_or(true, |last| {
                        now.duration_since(*last) >= Duration::from_secs(t.alert_cooldown_secs)
                    });
                    inner.next_id += 1;
                    let alert = Alert {
                        id: inner.next_id,
                        source_id: source_id.to_string(),
                        condition,
                        level: condition.level(),
                        message,
                        value,
                        threshold,
                        raised_at: Utc::now(),
                        resolved: false,
                    };
                    if cooled {
                        inner.last_fired.insert(key.clone(), now);
                        push_history(inner, alert.clone(), t.max_alerts);
                        emitted.push(alert.clone());
                    }
                    inner.active.insert(
                        key,
                        ActiveCondition {
                            announced: cooled,
                            alert,
                        },
                    );
                }
                (false, true) => {
                    if let Some(prev) = inner.active.remove(&key) {
                        if prev.announced {
                            inner.next_id += 1;
                            let alert = Alert {
                                id: inner.next_id,
                                source_id: source_id.to_string(),
                                condition,
                                level: AlertLevel::Info,
                                message: format!("{source_id}: {condition:?} resolved"),
                                value,
                                threshold,
                                raised_at: Utc::now(),
                                resolved: true,
                            };
                            push_history(inner, alert.clone(), t.max_alerts);
                            emitted.push(alert);
                        }
                    }
                }
                _ => {}
            }
        }
        emitted
    }
}

fn push_history(inner: &mut Inner, alert: Alert, max: usize) {
    inner.history.push_back(alert);
    while inner.history.len() > max {
        inner.history.pop_front();
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant, t: &PerformanceThresholds) {
    while samples.len() > t.max_samples {
        samples.pop_front();
    }
    let retention = Duration::from_secs(t.retention_secs);
    while let Some(front) = samples.front() {
        if now.duration_since(front.at) > retention {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn summarize(samples: &[Sample]) -> PerformanceSummary {
    if samples.is_empty() {
        return PerformanceSummary {
            success_rate: 1.0,
            ..Default::default()
        };
    }
    let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));
    let n = durations.len();
    let ok = samples.iter().filter(|s| s.success).count();

    PerformanceSummary {
        source_id: None,
        avg_ms: durations.iter().sum::<f64>() / n as f64,
        p50_ms: percentile(&durations, 50.0),
        p95_ms: percentile(&durations, 95.0),
        p99_ms: percentile(&durations, 99.0),
        success_rate: ok as f64 / n as f64,
        sample_count: n,
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Latest-window average over prior-window average, when both windows
/// are full and the prior one is non-zero.
fn degradation_ratio(samples: &[Sample], window: usize) -> Option<f64> {
    if window == 0 || samples.len() < window * 2 {
        return None;
    }
    let n = samples.len();
    let avg = |s: &[Sample]| s.iter().map(|x| x.duration_ms).sum::<f64>() / s.len() as f64;
    let latest = avg(&samples[n - window..]);
    let prior = avg(&samples[n - 2 * window..n - window]);
    (prior > 0.0).then(|| latest / prior)
}
