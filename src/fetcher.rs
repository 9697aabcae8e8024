// src/fetcher.rs
//! # Source Fetcher
//! One `(source, endpoint)` fetch with the whole resilience policy in one
//! place:
//!
//! 1. fresh cache hit → return it (no network, no rate-limit budget)
//! 2. wait for rate-limit admission
//! 3. network call under a hard timeout; retryable failures back off
//!    exponentially (plus jitter) and try again, each attempt re-admitted
//! 4. final failure → last cached value as a `Fallback`, else the error
//! 5. success → decode, cache, persist, record, reset backoff
//!
//! Every path ends in `Ok(Fetched)` or a typed [`FetchError`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::{CacheState, ResponseCache};
use crate::config::{EndpointSpec, FetchConfig, SourceDescriptor, TierTtls};
use crate::decode::{self, SourcePayload};
use crate::error::{FetchError, NetworkFailure};
use crate::perf::{PerformanceTracker, RequestOutcome};
use crate::persist::Persistence;
use crate::rate_limit::RateLimitGate;
use crate::registry::SourceRegistry;
use crate::transport::Transport;

/// Cache key of one endpoint: `{source}:{path}`.
pub fn cache_key(source_id: &str, path: &str) -> String {
    format!("{source_id}:{path}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Serve a fresh cache entry without touching the network.
    pub use_cache: bool,
    /// Always go to the network; any cached value is only a fallback.
    pub force_refresh: bool,
    /// Queue priority at the gate; defaults to the source's own.
    pub priority: Option<u8>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force_refresh: false,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Live,
    Cached,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: SourcePayload,
    pub provenance: Provenance,
    /// When the payload was retrieved from upstream.
    pub fetched_at: DateTime<Utc>,
    pub age: Duration,
    /// Why a fallback was served.
    pub error: Option<FetchError>,
    pub attempts: u32,
}

pub struct SourceFetcher {
    registry: Arc<SourceRegistry>,
    gate: RateLimitGate,
    cache: Arc<ResponseCache<SourcePayload>>,
    tracker: Arc<PerformanceTracker>,
    transport: Arc<dyn Transport>,
    persistence: Option<Persistence>,
    config: FetchConfig,
    tiers: TierTtls,
}

impl SourceFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SourceRegistry>,
        gate: RateLimitGate,
        cache: Arc<ResponseCache<SourcePayload>>,
        tracker: Arc<PerformanceTracker>,
        transport: Arc<dyn Transport>,
        persistence: Option<Persistence>,
        config: FetchConfig,
        tiers: TierTtls,
    ) -> Self {
        Self {
            registry,
            gate,
            cache,
            tracker,
            transport,
            persistence,
            config,
            tiers,
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &RateLimitGate {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<ResponseCache<SourcePayload>> {
        &self.cache
    }

    pub async fn fetch(
        &self,
        source_id: &str,
        endpoint: &str,
        opts: FetchOptions,
    ) -> Result<Fetched, FetchError> {
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))?;
        let spec = source
            .endpoints
            .iter()
            .find(|e| e.path == endpoint)
            .ok_or_else(|| FetchError::UnknownEndpoint {
                source_id: source_id.to_string(),
                endpoint: endpoint.to_string(),
            })?;
        if !self.registry.is_enabled(source_id) {
            counter!("fetch_requests_total", "source" => source_id.to_string(), "outcome" => "disabled")
                .increment(1);
            return Err(FetchError::SourceDisabled {
                source_id: source_id.to_string(),
            });
        }

        let key = cache_key(source_id, endpoint);
        if opts.use_cache && !opts.force_refresh {
            let hit = self.cache.get(&key);
            if let (CacheState::Fresh, Some(payload)) = (hit.state, hit.value) {
                tracing::debug!(target: "fetch", source = source_id, endpoint, "fresh cache hit");
                counter!("fetch_requests_total", "source" => source_id.to_string(), "outcome" => "cached")
                    .increment(1);
                return Ok(Fetched {
                    payload,
                    provenance: Provenance::Cached,
                    fetched_at: hit.written_at.unwrap_or_else(Utc::now),
                    age: hit.age.unwrap_or_default(),
                    error: None,
                    attempts: 0,
                });
            }
        }

        let priority = opts.priority.unwrap_or(source.priority);
        let (result, attempts) = self.fetch_live(&source, spec, priority).await;
        match result {
            Ok(payload) => {
                self.registry.record_success(source_id);
                self.store(&source, &key, payload.clone()).await;
                counter!("fetch_requests_total", "source" => source_id.to_string(), "outcome" => "live")
                    .increment(1);
                Ok(Fetched {
                    payload,
                    provenance: Provenance::Live,
                    fetched_at: Utc::now(),
                    age: Duration::ZERO,
                    error: None,
                    attempts,
                })
            }
            Err(err) => {
                if self.registry.record_failure(source_id) {
                    tracing::warn!(target: "fetch", source = source_id, "source disabled after repeated failures");
                }
                self.fallback(&key, err, attempts)
            }
        }
    }

    fn fallback(&self, key: &str, err: FetchError, attempts: u32) -> Result<Fetched, FetchError> {
        let source_id = err.source_id().to_string();
        let hit = self.cache.get(key);
        match hit.value {
            Some(payload) => {
                tracing::warn!(
                    target: "fetch",
                    source = %source_id,
                    key,
                    error = %err,
                    age_secs = hit.age.unwrap_or_default().as_secs(),
                    "serving cached fallback"
                );
                counter!("fetch_requests_total", "source" => source_id, "outcome" => "fallback")
                    .increment(1);
                Ok(Fetched {
                    payload,
                    provenance: Provenance::Fallback,
                    fetched_at: hit.written_at.unwrap_or_else(Utc::now),
                    age: hit.age.unwrap_or_default(),
                    error: Some(err),
                    attempts,
                })
            }
            None => {
                tracing::warn!(target: "fetch", source = %source_id, key, error = %err, "fetch failed, nothing cached");
                counter!("fetch_requests_total", "source" => source_id, "outcome" => "error")
                    .increment(1);
                Err(err)
            }
        }
    }

    /// Retry loop. Returns the final result and the number of attempts made.
    async fn fetch_live(
        &self,
        source: &SourceDescriptor,
        spec: &EndpointSpec,
        priority: u8,
    ) -> (Result<SourcePayload, FetchError>, u32) {
        let max_attempts = source.max_attempts.max(1);
        let url = source.url_for(&spec.path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(source, spec, &url, priority).await {
                Ok(payload) => return (Ok(payload), attempt),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return (Err(err), attempt);
            }

            let backoff = match &err {
                // gate already recorded the failure and returned its backoff
                FetchError::Network { .. } => self.current_backoff(&source.id),
                _ => retry_delay(source, attempt),
            };
            let delay = backoff + self.jitter(backoff);
            tracing::info!(
                target: "fetch",
                source = %source.id,
                endpoint = %spec.path,
                attempt,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One admitted network call plus decode.
    async fn attempt(
        &self,
        source: &SourceDescriptor,
        spec: &EndpointSpec,
        url: &str,
        priority: u8,
    ) -> Result<SourcePayload, FetchError> {
        let permit = self
            .gate
            .acquire(&source.id, priority, self.config.max_wait())
            .await?;

        let started = Instant::now();
        let started_at = Utc::now();
        let timeout = self.config.timeout();
        let response = match tokio::time::timeout(timeout, self.transport.get(url, timeout)).await {
            Ok(res) => res,
            Err(_) => Err(NetworkFailure::Timeout(timeout)),
        };
        let duration = started.elapsed();
        drop(permit);

        let record = |success: bool, status: Option<u16>| {
            self.tracker.record(&RequestOutcome {
                source_id: source.id.clone(),
                endpoint: spec.path.clone(),
                started_at,
                duration,
                success,
                status,
            });
        };

        let failure = match response {
            Ok(raw) if raw.is_success() => {
                self.gate.record_outcome(&source.id, true);
                return match decode::decode(&spec.decoder, &raw.body) {
                    Ok(payload) => {
                        record(true, Some(raw.status));
                        Ok(payload)
                    }
                    Err(e) => {
                        record(false, Some(raw.status));
                        tracing::warn!(target: "fetch", source = %source.id, endpoint = %spec.path, error = %e, "payload rejected");
                        Err(FetchError::Parse {
                            source_id: source.id.clone(),
                            endpoint: spec.path.clone(),
                            message: e.to_string(),
                        })
                    }
                };
            }
            Ok(raw) => NetworkFailure::Status(raw.status),
            Err(failure) => failure,
        };

        record(false, failure.status());
        let backoff = self.gate.record_outcome(&source.id, false);
        tracing::debug!(
            target: "fetch",
            source = %source.id,
            endpoint = %spec.path,
            error = %failure,
            backoff_ms = backoff.as_millis() as u64,
            "attempt failed"
        );
        Err(FetchError::Network {
            source_id: source.id.clone(),
            failure,
        })
    }

    fn current_backoff(&self, source_id: &str) -> Duration {
        self.gate
            .status(source_id)
            .map(|s| Duration::from_millis(s.current_backoff_ms))
            .unwrap_or_default()
    }

    fn jitter(&self, backoff: Duration) -> Duration {
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 || backoff.is_zero() {
            return Duration::ZERO;
        }
        backoff.mul_f64(rand::rng().random_range(0.0..ratio))
    }

    async fn store(&self, source: &SourceDescriptor, key: &str, payload: SourcePayload) {
        self.cache.put(key, payload, source.ttl(&self.tiers));
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(entry) = self.cache.export(key) {
            if let Err(e) = persistence.save_cache_entry(&entry).await {
                tracing::warn!(target: "fetch", key, error = %e, "persisting cache entry failed");
            }
        }
    }
}

/// `base * multiplier^(attempt-1)`, capped; used when the gate itself
/// refused admission and no failure was recorded.
fn retry_delay(source: &SourceDescriptor, attempt: u32) -> Duration {
    let p = &source.rate_limit;
    let exp = p.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let ms = (p.backoff_base_ms as f64 * exp).min(p.backoff_ceiling_ms as f64);
    Duration::from_millis(ms as u64)
}
