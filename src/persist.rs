// src/persist.rs
//! Schema-versioned, checksummed blobs for cache entries and snapshots.
//!
//! Every blob is a JSON envelope `{schema, kind, saved_at, checksum, body}`.
//! A blob whose schema, kind or checksum does not match is deleted on load
//! and never handed to the caller.
//!
//! Layout:
//! - `cache/{source}:{endpoint}`: one per cache entry
//! - `snapshot/latest`: the last published snapshot
//! - `snapshot/{version:010}`: the last `snapshot_history` versions

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::StoredEntry;
use crate::decode::SourcePayload;
use crate::store::BlobStore;

pub const SCHEMA_VERSION: u32 = 1;

pub const KIND_CACHE_ENTRY: &str = "cache_entry";
pub const KIND_SNAPSHOT: &str = "snapshot";

const CACHE_PREFIX: &str = "cache/";
const SNAPSHOT_PREFIX: &str = "snapshot/";
const SNAPSHOT_LATEST: &str = "snapshot/latest";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    schema: u32,
    kind: String,
    saved_at: DateTime<Utc>,
    checksum: String,
    body: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("not an envelope: {0}")]
    Malformed(String),
    #[error("unsupported schema version {found}")]
    SchemaMismatch { found: u32 },
    #[error("kind {found} (expected {expected})")]
    KindMismatch { found: String, expected: String },
    #[error("checksum mismatch")]
    Checksum,
    #[error("body does not match the stored type: {0}")]
    Body(String),
}

fn checksum(body: &serde_json::Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(body)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn seal<T: Serialize>(kind: &str, value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_value(value).context("serializing blob body")?;
    let envelope = Envelope {
        schema: SCHEMA_VERSION,
        kind: kind.to_string(),
        saved_at: Utc::now(),
        checksum: checksum(&body)?,
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn open<T: DeserializeOwned>(kind: &str, bytes: &[u8]) -> Result<T, EnvelopeError> {
    let env: Envelope =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if env.schema != SCHEMA_VERSION {
        return Err(EnvelopeError::SchemaMismatch { found: env.schema });
    }
    if env.kind != kind {
        return Err(EnvelopeError::KindMismatch {
            found: env.kind,
            expected: kind.to_string(),
        });
    }
    let expected = checksum(&env.body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if expected != env.checksum {
        return Err(EnvelopeError::Checksum);
    }
    serde_json::from_value(env.body).map_err(|e| EnvelopeError::Body(e.to_string()))
}

/// Cache and snapshot persistence over a [`BlobStore`].
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn BlobStore>,
    snapshot_history: usize,
    /// Highest snapshot version written by this process. Held across the
    /// writes, so snapshot saves never interleave.
    newest_snapshot: Arc<Mutex<u64>>,
}

impl Persistence {
    pub fn new(store: Arc<dyn BlobStore>, snapshot_history: usize) -> Self {
        Self {
            store,
            snapshot_history,
            newest_snapshot: Arc::new(Mutex::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Read and open one blob; invalid blobs are deleted.
    async fn load_blob<T: DeserializeOwned>(&self, key: &str, kind: &str) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        match open(kind, &bytes) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(target: "persist", key, error = %e, "discarding incompatible blob");
                self.store.delete(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn save_cache_entry(&self, entry: &StoredEntry<SourcePayload>) -> Result<()> {
        let key = format!("{CACHE_PREFIX}{}", entry.key);
        self.store.put(&key, seal(KIND_CACHE_ENTRY, entry)?).await
    }

    pub async fn load_cache_entries(&self) -> Result<Vec<StoredEntry<SourcePayload>>> {
        let mut out = Vec::new();
        for key in self.store.keys(CACHE_PREFIX).await? {
            if let Some(entry) = self
                .load_blob::<StoredEntry<SourcePayload>>(&key, KIND_CACHE_ENTRY)
                .await?
            {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Drop persisted cache entries whose cache key starts with `prefix`.
    pub async fn delete_cache_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.store.keys(&format!("{CACHE_PREFIX}{prefix}")).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        Ok(keys.len())
    }

    pub async fn delete_cache_entry(&self, cache_key: &str) -> Result<()> {
        self.store.delete(&format!("{CACHE_PREFIX}{cache_key}")).await
    }

    /// Write `snapshot` as version `version` and as `snapshot/latest`.
    /// A version older than one already saved is skipped.
    pub async fn save_snapshot<T: Serialize>(&self, version: u64, snapshot: &T) -> Result<()> {
        let mut newest = self.newest_snapshot.lock().await;
        if version < *newest {
            tracing::debug!(
                target: "persist",
                version,
                newest = *newest,
                "skipping superseded snapshot"
            );
            return Ok(());
        }
        let bytes = seal(KIND_SNAPSHOT, snapshot)?;
        self.store
            .put(&format!("{SNAPSHOT_PREFIX}{version:010}"), bytes.clone())
            .await?;
        self.store.put(SNAPSHOT_LATEST, bytes).await?;
        *newest = version;
        self.prune_snapshots().await
    }

    /// `snapshot/latest`, or the newest valid versioned snapshot if the
    /// latest blob is missing or unreadable.
    pub async fn load_latest_snapshot<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if let Some(s) = self.load_blob(SNAPSHOT_LATEST, KIND_SNAPSHOT).await? {
            return Ok(Some(s));
        }
        let mut versions = self.snapshot_version_keys().await?;
        versions.reverse();
        for key in versions {
            if let Some(s) = self.load_blob(&key, KIND_SNAPSHOT).await? {
                tracing::info!(target: "persist", key, "restored snapshot from version history");
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    async fn snapshot_version_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys(SNAPSHOT_PREFIX)
            .await?
            .into_iter()
            .filter(|k| k != SNAPSHOT_LATEST)
            .collect())
    }

    async fn prune_snapshots(&self) -> Result<()> {
        let keys = self.snapshot_version_keys().await?;
        let keep = self.snapshot_history.max(1);
        if keys.len() > keep {
            for key in &keys[..keys.len() - keep] {
                self.store.delete(key).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Observation;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snap {
        version: u64,
        note: String,
    }

    fn entry(key: &str) -> StoredEntry<SourcePayload> {
        StoredEntry {
            key: key.into(),
            value: SourcePayload::new(vec![Observation::new(
                "killed",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                3.0,
            )]),
            written_at: Utc::now(),
            ttl_ms: 60_000,
            version: 1,
        }
    }

    #[test]
    fn tampered_and_foreign_blobs_are_rejected() {
        let sealed = seal(KIND_SNAPSHOT, &Snap { version: 1, note: "a".into() }).unwrap();
        let ok: Snap = open(KIND_SNAPSHOT, &sealed).unwrap();
        assert_eq!(ok.version, 1);

        let tampered = String::from_utf8(sealed.clone()).unwrap().replace("\"a\"", "\"b\"");
        assert!(matches!(
            open::<Snap>(KIND_SNAPSHOT, tampered.as_bytes()),
            Err(EnvelopeError::Checksum)
        ));
        assert!(matches!(
            open::<Snap>(KIND_CACHE_ENTRY, &sealed),
            Err(EnvelopeError::KindMismatch { .. })
        ));

        let mut env: serde_json::Value = serde_json::from_slice(&sealed).unwrap();
        env["schema"] = serde_json::json!(0);
        let old = serde_json::to_vec(&env).unwrap();
        assert!(matches!(
            open::<Snap>(KIND_SNAPSHOT, &old),
            Err(EnvelopeError::SchemaMismatch { found: 0 })
        ));
        assert!(matches!(
            open::<Snap>(KIND_SNAPSHOT, b"{}"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn cache_entries_roundtrip_and_bad_ones_are_deleted() {
        let store = Arc::new(MemoryStore::new());
        let p = Persistence::new(store.clone(), 3);
        p.save_cache_entry(&entry("t4p:/daily.json")).await.unwrap();
        p.save_cache_entry(&entry("wb:/gdp")).await.unwrap();
        store.put("cache/broken", b"garbage".to_vec()).await.unwrap();

        let loaded = p.load_cache_entries().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(store.get("cache/broken").await.unwrap().is_none());

        assert_eq!(p.delete_cache_prefix("t4p:").await.unwrap(), 1);
        assert_eq!(p.load_cache_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_history_is_pruned_and_latest_falls_back() {
        let store = Arc::new(MemoryStore::new());
        let p = Persistence::new(store.clone(), 2);
        for v in 1..=4 {
            p.save_snapshot(v, &Snap { version: v, note: String::new() })
                .await
                .unwrap();
        }
        assert_eq!(
            store.keys("snapshot/").await.unwrap(),
            vec!["snapshot/0000000003", "snapshot/0000000004", "snapshot/latest"]
        );
        let latest: Snap = p.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.version, 4);

        store.put("snapshot/latest", b"corrupt".to_vec()).await.unwrap();
        let restored: Snap = p.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(restored.version, 4);
        assert!(store.get("snapshot/latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn superseded_snapshot_never_replaces_latest() {
        let store = Arc::new(MemoryStore::new());
        let p = Persistence::new(store.clone(), 3);
        p.save_snapshot(6, &Snap { version: 6, note: "full run".into() })
            .await
            .unwrap();
        // a slower writer that read the cell before v6 was published
        p.save_snapshot(5, &Snap { version: 5, note: "area".into() })
            .await
            .unwrap();

        let latest: Snap = p.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.version, 6);
        assert!(store.get("snapshot/0000000005").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_saves_leave_the_newest_latest() {
        let store = Arc::new(MemoryStore::new());
        let p = Persistence::new(store.clone(), 3);
        let saves = (1..=8u64).rev().map(|v| {
            let p = p.clone();
            tokio::spawn(async move {
                p.save_snapshot(v, &Snap { version: v, note: String::new() })
                    .await
            })
        });
        for res in futures::future::join_all(saves).await {
            res.unwrap().unwrap();
        }
        let latest: Snap = p.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.version, 8);
    }

    #[tokio::test]
    async fn empty_store_has_no_snapshot() {
        let p = Persistence::new(Arc::new(MemoryStore::new()), 2);
        assert!(p.load_latest_snapshot::<Snap>().await.unwrap().is_none());
    }
}
