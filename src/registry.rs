//! Source registry: the immutable descriptors plus the two pieces of
//! runtime state operators care about, the enabled flag and a
//! consecutive-failure counter used for auto-disable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::SourceDescriptor;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub disabled_reason: Option<String>,
}

#[derive(Debug)]
struct Entry {
    descriptor: Arc<SourceDescriptor>,
    health: SourceHealth,
}

#[derive(Debug)]
pub struct SourceRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    auto_disable_after: u32,
}

impl SourceRegistry {
    pub fn new(sources: impl IntoIterator<Item = SourceDescriptor>, auto_disable_after: u32) -> Self {
        let entries = sources
            .into_iter()
            .map(|d| {
                let health = SourceHealth {
                    enabled: d.enabled,
                    ..SourceHealth::default()
                };
                (
                    d.id.clone(),
                    Entry {
                        descriptor: Arc::new(d),
                        health,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
            auto_disable_after,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceDescriptor>> {
        self.entries.read().get(id).map(|e| e.descriptor.clone())
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.entries
            .read()
            .get(id)
            .is_some_and(|e| e.health.enabled)
    }

    /// Enabled descriptors, sorted by (priority, id).
    pub fn enabled(&self) -> Vec<Arc<SourceDescriptor>> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| e.health.enabled)
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn all(&self) -> Vec<Arc<SourceDescriptor>> {
        self.entries
            .read()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Operator toggle. Returns `false` for unknown sources.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.health.enabled = enabled;
        if enabled {
            entry.health.consecutive_failures = 0;
            entry.health.disabled_reason = None;
        } else {
            entry.health.disabled_reason = Some("disabled by operator".to_string());
        }
        tracing::info!(target: "registry", source = id, enabled, "source toggled");
        true
    }

    pub fn record_success(&self, id: &str) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            let h = &mut entry.health;
            h.consecutive_failures = 0;
            h.total_successes += 1;
            h.last_success = Some(Utc::now());
        }
    }

    /// Returns `true` when this failure auto-disabled the source.
    pub fn record_failure(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        let h = &mut entry.health;
        h.consecutive_failures += 1;
        h.total_failures += 1;
        h.last_failure = Some(Utc::now());

        if self.auto_disable_after > 0
            && h.enabled
            && h.consecutive_failures >= self.auto_disable_after
        {
            h.enabled = false;
            h.disabled_reason = Some(format!(
                "auto-disabled after {} consecutive failures",
                h.consecutive_failures
            ));
            tracing::warn!(
                target: "registry",
                source = id,
                failures = h.consecutive_failures,
                "source auto-disabled"
            );
            return true;
        }
        false
    }

    pub fn health(&self, id: &str) -> Option<SourceHealth> {
        self.entries.read().get(id).map(|e| e.health.clone())
    }

    pub fn health_all(&self) -> BTreeMap<String, SourceHealth> {
        self.entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.health.clone()))
            .collect()
    }
}
