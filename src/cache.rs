//! Response cache with per-entry TTL.
//!
//! Lookups classify an entry as fresh (age < ttl), stale (present but
//! expired) or absent. Stale entries are kept: they are the fallback
//! candidates when a live fetch fails. Nothing here ever promotes a stale
//! entry back to fresh; only a new `put` does.
//!
//! Ages are measured on the tokio clock, so tests can drive expiry with a
//! paused runtime. Entries restored from the blob store carry their wall
//! clock age forward as an offset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Fresh,
    Stale,
    Absent,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Fresh => "fresh",
            CacheState::Stale => "stale",
            CacheState::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLookup<V> {
    pub value: Option<V>,
    pub state: CacheState,
    pub age: Option<Duration>,
    pub written_at: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl<V> CacheLookup<V> {
    fn absent() -> Self {
        Self {
            value: None,
            state: CacheState::Absent,
            age: None,
            written_at: None,
            version: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.state == CacheState::Fresh
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    written_at: DateTime<Utc>,
    stored_at: Instant,
    /// Age the entry already had when it was stored (restored entries).
    age_offset: Duration,
    ttl: Duration,
    version: u64,
}

impl<V> Entry<V> {
    fn age(&self) -> Duration {
        self.age_offset + self.stored_at.elapsed()
    }
}

/// Persistable form of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry<V> {
    pub key: String,
    pub value: V,
    pub written_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub version: u64,
}

#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    next_version: AtomicU64,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }
}

impl<V: Clone> ResponseCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> CacheLookup<V> {
        let lookup = match self.entries.read().get(key) {
            None => CacheLookup::absent(),
            Some(e) => {
                let age = e.age();
                CacheLookup {
                    value: Some(e.value.clone()),
                    state: if age < e.ttl {
                        CacheState::Fresh
                    } else {
                        CacheState::Stale
                    },
                    age: Some(age),
                    written_at: Some(e.written_at),
                    version: Some(e.version),
                }
            }
        };
        counter!("cache_lookups_total", "state" => lookup.state.as_str()).increment(1);
        lookup
    }

    /// Store a value; returns its new version.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(
            key.into(),
            Entry {
                value,
                written_at: Utc::now(),
                stored_at: Instant::now(),
                age_offset: Duration::ZERO,
                ttl,
                version,
            },
        );
        version
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drop every key starting with `prefix`; returns how many went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn export(&self, key: &str) -> Option<StoredEntry<V>> {
        self.entries.read().get(key).map(|e| StoredEntry {
            key: key.to_string(),
            value: e.value.clone(),
            written_at: e.written_at,
            ttl_ms: e.ttl.as_millis() as u64,
            version: e.version,
        })
    }

    /// Restore a persisted entry. Its age is taken from the wall clock and
    /// its version is kept; later `put`s get higher versions.
    /// An in-memory entry written at the same time or later wins.
    pub fn import(&self, stored: StoredEntry<V>) -> bool {
        let mut entries = self.entries.write();
        let mut version = stored.version;
        if let Some(existing) = entries.get(&stored.key) {
            if existing.written_at >= stored.written_at {
                return false;
            }
            if existing.version >= version {
                version = self.next_version.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.next_version
            .fetch_max(version.saturating_add(1), Ordering::Relaxed);
        let age_offset = (Utc::now() - stored.written_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        entries.insert(
            stored.key,
            Entry {
                value: stored.value,
                written_at: stored.written_at,
                stored_at: Instant::now(),
                age_offset,
                ttl: Duration::from_millis(stored.ttl_ms),
                version,
            },
        );
        true
    }
}
