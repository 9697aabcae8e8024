//! Error taxonomy for the fetch → consolidate pipeline.
//!
//! Every failure path of an upstream call resolves to a [`FetchError`]
//! (or a stale fallback, see `fetcher`), never a panic. Application glue
//! (config loading, persistence, startup) uses `anyhow` instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a network call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkFailure {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("HTTP status {0}")]
    Status(u16),
}

impl NetworkFailure {
    /// Connect failures, timeouts, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkFailure::Connect(_) | NetworkFailure::Timeout(_) => true,
            NetworkFailure::Status(code) => matches!(code, 408 | 429 | 500..=599),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            NetworkFailure::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Errors that can occur when fetching one (source, endpoint) pair.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("network error from {source_id}: {failure}")]
    Network {
        source_id: String,
        failure: NetworkFailure,
    },

    #[error("rate limited on {source_id}, retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        source_id: String,
        retry_after: Duration,
    },

    #[error("could not parse {endpoint} from {source_id}: {message}")]
    Parse {
        source_id: String,
        endpoint: String,
        message: String,
    },

    #[error("source {source_id} is disabled")]
    SourceDisabled { source_id: String },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("source {source_id} has no endpoint {endpoint}")]
    UnknownEndpoint { source_id: String, endpoint: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network { .. } => ErrorKind::Network,
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Parse { .. } => ErrorKind::Parse,
            FetchError::SourceDisabled { .. } => ErrorKind::SourceDisabled,
            FetchError::UnknownSource(_) | FetchError::UnknownEndpoint { .. } => {
                ErrorKind::UnknownSource
            }
        }
    }

    /// Network and rate-limit failures are retried locally; everything else
    /// is final on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { failure, .. } => failure.is_retryable(),
            FetchError::RateLimited { .. } => true,
            _ => false,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            FetchError::Network { source_id, .. }
            | FetchError::RateLimited { source_id, .. }
            | FetchError::Parse { source_id, .. }
            | FetchError::SourceDisabled { source_id }
            | FetchError::UnknownEndpoint { source_id, .. } => source_id,
            FetchError::UnknownSource(id) => id,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::Network { failure, .. } => failure.status(),
            _ => None,
        }
    }
}

/// Serializable error class, used in status objects and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimited,
    Parse,
    SourceDisabled,
    UnknownSource,
}

/// Errors surfaced by the consolidator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsolidationError {
    #[error("unknown domain area: {0}")]
    UnknownArea(String),

    #[error("{} domain area(s) unavailable: {}", .unavailable.len(), .unavailable.join(", "))]
    PartialFailure { unavailable: Vec<String> },
}
