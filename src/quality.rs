// src/quality.rs
//! Data-quality scoring. Three components, each in `[0, 1]`:
//! - freshness: mean credit of the contributions (live/cached 1,
//!   fallback `fallback_credit`, failed 0)
//! - recency: linear decay on the age of the freshest retrieval
//! - completeness: share of the area's expected metrics present
//!
//! The area score is their weighted mean; the snapshot score is the
//! area-weighted mean of area scores.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::QualityPolicy;
use crate::merge::MergedArea;

/// How one (source, endpoint) contributed to an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionState {
    Live,
    Cached,
    Fallback,
    Failed,
    /// Not fetched: the source is switched off. Not scored.
    Disabled,
}

impl ContributionState {
    pub fn has_data(&self) -> bool {
        matches!(
            self,
            ContributionState::Live | ContributionState::Cached | ContributionState::Fallback
        )
    }

    fn credit(&self, policy: &QualityPolicy) -> Option<f64> {
        match self {
            ContributionState::Live | ContributionState::Cached => Some(1.0),
            ContributionState::Fallback => Some(policy.fallback_credit),
            ContributionState::Failed => Some(0.0),
            ContributionState::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub score: f64,
    pub freshness: f64,
    pub recency: f64,
    pub completeness: f64,
}

pub fn recency(age: Duration, policy: &QualityPolicy) -> f64 {
    let full = policy.recency_full_secs as f64;
    let zero = policy.recency_zero_secs as f64;
    let age = age.as_secs_f64();
    if age <= full {
        1.0
    } else if age >= zero || zero <= full {
        0.0
    } else {
        1.0 - (age - full) / (zero - full)
    }
}

pub fn completeness(data: &MergedArea, expected: &[String]) -> f64 {
    if expected.is_empty() {
        return if data.is_empty() { 0.0 } else { 1.0 };
    }
    let present = expected.iter().filter(|m| data.has_metric(m)).count();
    present as f64 / expected.len() as f64
}

/// Score one area. `contributions` pairs each state with its retrieval age
/// (`None` for failed/disabled).
pub fn score_area(
    contributions: &[(ContributionState, Option<Duration>)],
    data: Option<&MergedArea>,
    expected: &[String],
    policy: &QualityPolicy,
) -> QualityBreakdown {
    let Some(data) = data else {
        return QualityBreakdown::default();
    };
    let credits: Vec<f64> = contributions
        .iter()
        .filter_map(|(s, _)| s.credit(policy))
        .collect();
    if credits.is_empty() {
        return QualityBreakdown::default();
    }
    let freshness = credits.iter().sum::<f64>() / credits.len() as f64;

    let freshest = contributions
        .iter()
        .filter(|(s, _)| s.has_data())
        .filter_map(|(_, age)| *age)
        .min();
    let recency = freshest.map_or(0.0, |age| recency(age, policy));
    let completeness = completeness(data, expected);

    let w = &policy.weights;
    let total = w.freshness + w.recency + w.completeness;
    let score = if total > 0.0 {
        (w.freshness * freshness + w.recency * recency + w.completeness * completeness) / total
    } else {
        0.0
    };

    QualityBreakdown {
        score: score.clamp(0.0, 1.0),
        freshness,
        recency,
        completeness,
    }
}

/// Weighted mean of `(weight, score)`; equal weights if all are zero.
pub fn overall(areas: impl IntoIterator<Item = (f64, f64)>) -> f64 {
    let areas: Vec<(f64, f64)> = areas.into_iter().collect();
    if areas.is_empty() {
        return 0.0;
    }
    let total: f64 = areas.iter().map(|(w, _)| w).sum();
    if total <= 0.0 {
        return areas.iter().map(|(_, s)| s).sum::<f64>() / areas.len() as f64;
    }
    areas.iter().map(|(w, s)| w * s).sum::<f64>() / total
}
