// src/consolidate.rs
//! # Consolidator
//! Fans out every `(source, endpoint)` fetch a run needs, absorbs results
//! as they complete and publishes one immutable snapshot.
//!
//! - Jobs are dispatched concurrently in source-priority order; the only
//!   throttle is each source's own rate-limit gate.
//! - Results land in a per-area accumulator keyed by (source, endpoint).
//!   An area is merged once its last job resolves, so completion order
//!   never changes the outcome.
//! - Areas with no data are published as `unavailable`; values from the
//!   previous snapshot are never carried over.
//! - A run in which every area it refreshed is unavailable publishes
//!   nothing. Full, targeted and single-area runs share this rule.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{AreaSpec, QualityPolicy, SourceDescriptor};
use crate::error::{ConsolidationError, ErrorKind, FetchError};
use crate::fetcher::{FetchOptions, Fetched, Provenance, SourceFetcher};
use crate::merge::{merge, MergeInput, MergedArea};
use crate::quality::{self, ContributionState, QualityBreakdown};
use crate::status::{RunOutcome, SourceFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaStatus {
    /// Every contribution is live or freshly cached.
    Fresh,
    /// Has data, but some contributions failed or fell back.
    Degraded,
    /// No data this run.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_id: String,
    pub endpoint: String,
    pub state: ContributionState,
    pub fetched_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub observations: usize,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaSnapshot {
    pub key: String,
    pub status: AreaStatus,
    pub data: Option<MergedArea>,
    pub quality: QualityBreakdown,
    pub contributions: Vec<SourceContribution>,
    pub refreshed_at: DateTime<Utc>,
}

impl AreaSnapshot {
    pub fn is_available(&self) -> bool {
        self.status != AreaStatus::Unavailable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedSnapshot {
    pub version: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub data_quality: f64,
    /// sha256 over the area statuses and data.
    pub content_hash: String,
    pub areas: BTreeMap<String, AreaSnapshot>,
}

impl ConsolidatedSnapshot {
    pub fn area(&self, key: &str) -> Option<&AreaSnapshot> {
        self.areas.get(key)
    }

    pub fn unavailable_areas(&self) -> Vec<String> {
        self.areas
            .values()
            .filter(|a| !a.is_available())
            .map(|a| a.key.clone())
            .collect()
    }
}

fn content_hash(areas: &BTreeMap<String, AreaSnapshot>) -> String {
    let view: BTreeMap<&str, (AreaStatus, Option<&MergedArea>)> = areas
        .iter()
        .map(|(k, a)| (k.as_str(), (a.status, a.data.as_ref())))
        .collect();
    let bytes = serde_json::to_vec(&view).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The published snapshot. Readers get an `Arc`; writers swap it whole.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<ConsolidatedSnapshot>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<ConsolidatedSnapshot> {
        self.current.read().clone()
    }

    /// Install a snapshot restored from storage unless a newer one is
    /// already published.
    pub fn restore(&self, snapshot: ConsolidatedSnapshot) -> bool {
        let mut cur = self.current.write();
        if snapshot.version <= cur.version {
            return false;
        }
        *cur = Arc::new(snapshot);
        true
    }

    /// Read-modify-write under the lock; `f` returns `None` to keep the
    /// current snapshot.
    fn publish_with(
        &self,
        f: impl FnOnce(&ConsolidatedSnapshot) -> Option<ConsolidatedSnapshot>,
    ) -> (Arc<ConsolidatedSnapshot>, bool) {
        let mut cur = self.current.write();
        match f(&cur) {
            Some(next) => {
                *cur = Arc::new(next);
                (cur.clone(), true)
            }
            None => (cur.clone(), false),
        }
    }
}

/// Progress callbacks from a running consolidation.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize);

    fn on_failure(&self, _failure: &SourceFailure) {}
}

impl ProgressObserver for () {
    fn on_progress(&self, _completed: usize, _total: usize) {}
}

/// What a run should refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Only refresh areas fed by these sources.
    pub sources: Vec<String>,
    /// Only refresh these areas (in addition to `sources`).
    pub areas: Vec<String>,
    /// Bypass fresh cache entries (for the listed sources, or all).
    pub force_refresh: bool,
}

impl RefreshOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_targeted(&self) -> bool {
        !self.sources.is_empty() || !self.areas.is_empty()
    }

    fn forces(&self, source_id: &str) -> bool {
        self.force_refresh && (self.sources.is_empty() || self.sources.iter().any(|s| s == source_id))
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidationRun {
    /// Snapshot in force after the run (the previous one if nothing was published).
    pub snapshot: Arc<ConsolidatedSnapshot>,
    pub published: bool,
    pub outcome: RunOutcome,
    pub failures: Vec<SourceFailure>,
    pub refreshed_areas: Vec<String>,
    pub unavailable: Vec<String>,
}

impl ConsolidationRun {
    pub fn partial_failure(&self) -> Option<ConsolidationError> {
        (!self.unavailable.is_empty()).then(|| ConsolidationError::PartialFailure {
            unavailable: self.unavailable.clone(),
        })
    }
}

/// Result of a single-area consolidation.
#[derive(Debug, Clone, Serialize)]
pub struct PartialUpdate {
    pub area: AreaSnapshot,
    pub failures: Vec<SourceFailure>,
    pub published: bool,
    pub snapshot_version: u64,
}

struct Job {
    area: String,
    source: Arc<SourceDescriptor>,
    endpoint: String,
    opts: FetchOptions,
}

struct JobResult {
    priority: u8,
    result: Result<Fetched, FetchError>,
}

#[derive(Default)]
struct AreaAcc {
    remaining: usize,
    results: BTreeMap<(String, String), JobResult>,
    disabled: BTreeSet<(String, String)>,
}

pub struct Consolidator {
    fetcher: Arc<SourceFetcher>,
    areas: Vec<AreaSpec>,
    quality: QualityPolicy,
    cell: Arc<SnapshotCell>,
}

impl Consolidator {
    pub fn new(
        fetcher: Arc<SourceFetcher>,
        areas: Vec<AreaSpec>,
        quality: QualityPolicy,
        cell: Arc<SnapshotCell>,
    ) -> Self {
        Self {
            fetcher,
            areas,
            quality,
            cell,
        }
    }

    pub fn snapshot(&self) -> Arc<ConsolidatedSnapshot> {
        self.cell.load()
    }

    pub fn areas(&self) -> &[AreaSpec] {
        &self.areas
    }

    /// Areas fed by any of `sources`, in config order.
    pub fn areas_fed_by(&self, sources: &[String]) -> Vec<String> {
        let fed: BTreeSet<String> = sources
            .iter()
            .filter_map(|id| self.fetcher.registry().get(id))
            .flat_map(|s| s.endpoints.iter().map(|e| e.area.clone()).collect::<Vec<_>>())
            .collect();
        self.areas
            .iter()
            .filter(|a| fed.contains(&a.key))
            .map(|a| a.key.clone())
            .collect()
    }

    fn target_areas(&self, opts: &RefreshOptions) -> Vec<String> {
        if !opts.is_targeted() {
            return self.areas.iter().map(|a| a.key.clone()).collect();
        }
        let mut wanted: BTreeSet<String> = self.areas_fed_by(&opts.sources).into_iter().collect();
        wanted.extend(opts.areas.iter().cloned());
        self.areas
            .iter()
            .filter(|a| wanted.contains(&a.key))
            .map(|a| a.key.clone())
            .collect()
    }

    /// Full run, or a targeted one when `opts` names sources or areas.
    pub async fn consolidate_all(
        &self,
        opts: &RefreshOptions,
        observer: &dyn ProgressObserver,
    ) -> ConsolidationRun {
        let keys = self.target_areas(opts);
        tracing::info!(
            target: "consolidate",
            areas = keys.len(),
            targeted = opts.is_targeted(),
            force = opts.force_refresh,
            "consolidation started"
        );

        let computed = self.run_areas(&keys, opts, observer).await;
        let unavailable: Vec<String> = computed
            .iter()
            .filter(|(a, _)| !a.is_available())
            .map(|(a, _)| a.key.clone())
            .collect();
        let failures: Vec<SourceFailure> =
            computed.iter().flat_map(|(_, f)| f.iter().cloned()).collect();
        let refreshed: Vec<&AreaSnapshot> = computed.iter().map(|(a, _)| a).collect();
        let (snapshot, published) = self.publish(&refreshed, opts.is_targeted());

        let outcome = if !published {
            RunOutcome::Failed
        } else if unavailable.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Partial
        };
        counter!("consolidation_runs_total", "outcome" => outcome.as_str()).increment(1);
        if published {
            gauge!("snapshot_data_quality").set(snapshot.data_quality);
        }

        match outcome {
            RunOutcome::Failed => tracing::warn!(
                target: "consolidate",
                failures = failures.len(),
                "every area unavailable, keeping snapshot v{}",
                snapshot.version
            ),
            _ => tracing::info!(
                target: "consolidate",
                version = snapshot.version,
                quality = snapshot.data_quality,
                unavailable = unavailable.len(),
                failures = failures.len(),
                "snapshot published"
            ),
        }

        ConsolidationRun {
            snapshot,
            published,
            outcome,
            failures,
            refreshed_areas: keys,
            unavailable,
        }
    }

    /// Re-fetch and re-merge one area, splicing it into the published
    /// snapshot if it has data.
    pub async fn consolidate_one(
        &self,
        area: &str,
        opts: &RefreshOptions,
    ) -> Result<PartialUpdate, ConsolidationError> {
        if !self.areas.iter().any(|a| a.key == area) {
            return Err(ConsolidationError::UnknownArea(area.to_string()));
        }
        let mut computed = self.run_areas(&[area.to_string()], opts, &()).await;
        let (snapshot, failures) = computed
            .pop()
            .ok_or_else(|| ConsolidationError::UnknownArea(area.to_string()))?;

        let (published_snapshot, published) = self.publish(&[&snapshot], true);
        if published {
            gauge!("snapshot_data_quality").set(published_snapshot.data_quality);
        }

        Ok(PartialUpdate {
            area: snapshot,
            failures,
            published,
            snapshot_version: published_snapshot.version,
        })
    }

    /// Publish the refreshed areas, replacing the whole area map or
    /// splicing into the current one. Refreshed areas without data are
    /// published as unavailable, unless every refreshed area is: then
    /// nothing is published and the current snapshot stays.
    fn publish(
        &self,
        refreshed: &[&AreaSnapshot],
        splice: bool,
    ) -> (Arc<ConsolidatedSnapshot>, bool) {
        let all_unavailable = refreshed.iter().all(|a| !a.is_available());
        self.cell.publish_with(|current| {
            if all_unavailable {
                return None;
            }
            let mut areas = if splice {
                current.areas.clone()
            } else {
                BTreeMap::new()
            };
            for &area in refreshed {
                areas.insert(area.key.clone(), area.clone());
            }
            Some(self.build_snapshot(current.version + 1, areas))
        })
    }

    fn build_snapshot(
        &self,
        version: u64,
        areas: BTreeMap<String, AreaSnapshot>,
    ) -> ConsolidatedSnapshot {
        let data_quality = quality::overall(areas.values().map(|a| {
            let weight = self
                .areas
                .iter()
                .find(|spec| spec.key == a.key)
                .map_or(1.0, |spec| spec.weight);
            (weight, a.quality.score)
        }));
        ConsolidatedSnapshot {
            version,
            last_updated: Some(Utc::now()),
            data_quality,
            content_hash: content_hash(&areas),
            areas,
        }
    }

    /// Fetch and finalize the given areas. Output follows `keys` order.
    async fn run_areas(
        &self,
        keys: &[String],
        opts: &RefreshOptions,
        observer: &dyn ProgressObserver,
    ) -> Vec<(AreaSnapshot, Vec<SourceFailure>)> {
        let registry = self.fetcher.registry();
        let wanted: BTreeSet<&str> = keys.iter().map(String::as_str).collect();

        let mut sources = registry.all();
        sources.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let mut accs: HashMap<String, AreaAcc> =
            keys.iter().map(|k| (k.clone(), AreaAcc::default())).collect();
        let mut jobs = Vec::new();
        for source in &sources {
            let enabled = registry.is_enabled(&source.id);
            for ep in source.endpoints.iter().filter(|e| wanted.contains(e.area.as_str())) {
                let Some(acc) = accs.get_mut(&ep.area) else {
                    continue;
                };
                if !enabled {
                    acc.disabled.insert((source.id.clone(), ep.path.clone()));
                    continue;
                }
                acc.remaining += 1;
                jobs.push(Job {
                    area: ep.area.clone(),
                    source: source.clone(),
                    endpoint: ep.path.clone(),
                    opts: FetchOptions {
                        use_cache: true,
                        force_refresh: opts.forces(&source.id),
                        priority: None,
                    },
                });
            }
        }

        let total = keys.len();
        let mut done: HashMap<String, (AreaSnapshot, Vec<SourceFailure>)> = HashMap::new();
        for key in keys {
            if accs.get(key).is_some_and(|a| a.remaining == 0) {
                if let Some(acc) = accs.remove(key) {
                    done.insert(key.clone(), self.finalize(key, acc));
                }
            }
        }
        observer.on_progress(done.len(), total);

        let fetcher = &self.fetcher;
        let mut pending: FuturesUnordered<_> = jobs
            .into_iter()
            .map(|job| async move {
                let result = fetcher.fetch(&job.source.id, &job.endpoint, job.opts).await;
                (job, result)
            })
            .collect();

        while let Some((job, result)) = pending.next().await {
            let Some(acc) = accs.get_mut(&job.area) else {
                continue;
            };
            acc.results.insert(
                (job.source.id.clone(), job.endpoint.clone()),
                JobResult {
                    priority: job.source.priority,
                    result,
                },
            );
            acc.remaining = acc.remaining.saturating_sub(1);
            if acc.remaining == 0 {
                if let Some(acc) = accs.remove(&job.area) {
                    let finished = self.finalize(&job.area, acc);
                    for failure in &finished.1 {
                        observer.on_failure(failure);
                    }
                    done.insert(job.area.clone(), finished);
                    observer.on_progress(done.len(), total);
                }
            }
        }

        keys.iter().filter_map(|k| done.remove(k)).collect()
    }

    /// Pure given the accumulated results: merge, score, classify.
    fn finalize(&self, key: &str, acc: AreaAcc) -> (AreaSnapshot, Vec<SourceFailure>) {
        let now = Utc::now();
        let spec = self.areas.iter().find(|a| a.key == key);
        let mut contributions = Vec::new();
        let mut scored: Vec<(ContributionState, Option<Duration>)> = Vec::new();
        let mut failures = Vec::new();
        let mut inputs = Vec::new();

        for ((source_id, endpoint), job) in &acc.results {
            match &job.result {
                Ok(fetched) => {
                    let state = match fetched.provenance {
                        Provenance::Live => ContributionState::Live,
                        Provenance::Cached => ContributionState::Cached,
                        Provenance::Fallback => ContributionState::Fallback,
                    };
                    if let Some(err) = &fetched.error {
                        failures.push(SourceFailure {
                            source_id: source_id.clone(),
                            endpoint: endpoint.clone(),
                            area: key.to_string(),
                            kind: err.kind(),
                            message: err.to_string(),
                            fallback_served: true,
                            at: now,
                        });
                    }
                    contributions.push(SourceContribution {
                        source_id: source_id.clone(),
                        endpoint: endpoint.clone(),
                        state,
                        fetched_at: Some(fetched.fetched_at),
                        age_secs: Some(fetched.age.as_secs()),
                        observations: fetched.payload.len(),
                        error_kind: fetched.error.as_ref().map(FetchError::kind),
                        error: fetched.error.as_ref().map(ToString::to_string),
                    });
                    scored.push((state, Some(fetched.age)));
                    inputs.push(MergeInput {
                        source_id: source_id.as_str(),
                        endpoint: endpoint.as_str(),
                        priority: job.priority,
                        payload: &fetched.payload,
                    });
                }
                Err(FetchError::SourceDisabled { .. }) => {
                    contributions.push(disabled(source_id, endpoint));
                    scored.push((ContributionState::Disabled, None));
                }
                Err(err) => {
                    failures.push(SourceFailure {
                        source_id: source_id.clone(),
                        endpoint: endpoint.clone(),
                        area: key.to_string(),
                        kind: err.kind(),
                        message: err.to_string(),
                        fallback_served: false,
                        at: now,
                    });
                    contributions.push(SourceContribution {
                        source_id: source_id.clone(),
                        endpoint: endpoint.clone(),
                        state: ContributionState::Failed,
                        fetched_at: None,
                        age_secs: None,
                        observations: 0,
                        error_kind: Some(err.kind()),
                        error: Some(err.to_string()),
                    });
                    scored.push((ContributionState::Failed, None));
                }
            }
        }
        for (source_id, endpoint) in &acc.disabled {
            contributions.push(disabled(source_id, endpoint));
            scored.push((ContributionState::Disabled, None));
        }

        let (merge_strategy, expected) = spec
            .map(|s| (s.merge, s.expected_metrics.as_slice()))
            .unwrap_or_default();
        let data = (!inputs.is_empty()).then(|| merge(merge_strategy, &inputs));
        let quality = quality::score_area(&scored, data.as_ref(), expected, &self.quality);

        let status = match &data {
            None => AreaStatus::Unavailable,
            Some(_)
                if contributions.iter().any(|c| {
                    matches!(c.state, ContributionState::Failed | ContributionState::Fallback)
                }) =>
            {
                AreaStatus::Degraded
            }
            Some(_) => AreaStatus::Fresh,
        };
        if status == AreaStatus::Unavailable {
            tracing::warn!(target: "consolidate", area = key, failures = failures.len(), "area unavailable");
        }

        (
            AreaSnapshot {
                key: key.to_string(),
                status,
                data,
                quality,
                contributions,
                refreshed_at: now,
            },
            failures,
        )
    }
}

fn disabled(source_id: &str, endpoint: &str) -> SourceContribution {
    SourceContribution {
        source_id: source_id.to_string(),
        endpoint: endpoint.to_string(),
        state: ContributionState::Disabled,
        fetched_at: None,
        age_secs: None,
        observations: 0,
        error_kind: Some(ErrorKind::SourceDisabled),
        error: None,
    }
}
