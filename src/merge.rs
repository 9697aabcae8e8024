// src/merge.rs
//! Pure, order-independent merge of source payloads into one area.
//!
//! Inputs are ranked by (priority, source id, endpoint) before anything
//! else happens, so the result depends only on the set of inputs, never
//! on the order their fetches completed in.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::MergeStrategy;
use crate::decode::SourcePayload;

/// One source's payload feeding an area.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub source_id: &'a str,
    pub endpoint: &'a str,
    pub priority: u8,
    pub payload: &'a SourcePayload,
}

impl MergeInput<'_> {
    fn rank(&self) -> (u8, &str, &str) {
        (self.priority, self.source_id, self.endpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub date: NaiveDate,
    pub value: f64,
    /// Sources the value came from, sorted.
    pub sources: Vec<String>,
}

/// Merged content of an area: metric → points sorted by date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedArea {
    pub metrics: BTreeMap<String, Vec<DataPoint>>,
}

impl MergedArea {
    pub fn has_metric(&self, metric: &str) -> bool {
        self.metrics.get(metric).is_some_and(|p| !p.is_empty())
    }

    pub fn latest(&self, metric: &str) -> Option<&DataPoint> {
        self.metrics.get(metric).and_then(|p| p.last())
    }

    pub fn point_count(&self) -> usize {
        self.metrics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }
}

/// Per input, collapse duplicate (metric, date) rows: the last row wins.
fn dedup(payload: &SourcePayload) -> BTreeMap<(&str, NaiveDate), f64> {
    payload
        .observations
        .iter()
        .map(|o| ((o.metric.as_str(), o.date), o.value))
        .collect()
}

pub fn merge(strategy: MergeStrategy, inputs: &[MergeInput<'_>]) -> MergedArea {
    let mut ranked: Vec<&MergeInput<'_>> = inputs.iter().collect();
    ranked.sort_by(|a, b| a.rank().cmp(&b.rank()));

    // (metric, date) → (value, sources); filled best rank first
    let mut cells: BTreeMap<(String, NaiveDate), (f64, Vec<String>)> = BTreeMap::new();
    for input in &ranked {
        for ((metric, date), value) in dedup(input.payload) {
            let key = (metric.to_string(), date);
            match strategy {
                MergeStrategy::Sum => {
                    let cell = cells.entry(key).or_insert((0.0, Vec::new()));
                    cell.0 += value;
                    cell.1.push(input.source_id.to_string());
                }
                MergeStrategy::Latest | MergeStrategy::Union => {
                    cells
                        .entry(key)
                        .or_insert_with(|| (value, vec![input.source_id.to_string()]));
                }
            }
        }
    }

    let mut metrics: BTreeMap<String, Vec<DataPoint>> = BTreeMap::new();
    for ((metric, date), (value, mut sources)) in cells {
        sources.sort();
        sources.dedup();
        metrics.entry(metric).or_default().push(DataPoint {
            date,
            value,
            sources,
        });
    }

    if strategy == MergeStrategy::Latest {
        for points in metrics.values_mut() {
            // BTreeMap iteration already sorted by date
            if let Some(last) = points.pop() {
                *points = vec![last];
            }
        }
    }

    MergedArea { metrics }
}
