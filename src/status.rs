// src/status.rs
//! Live refresh status.
//!
//! One [`StatusBoard`] per core. Writers are the scheduler and the
//! consolidation progress observer; readers get cloned values, a
//! `watch::Receiver`, or a callback [`Subscription`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Startup,
    Interval,
    Manual,
    Focus,
    Reconnect,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Startup => "startup",
            RefreshTrigger::Interval => "interval",
            RefreshTrigger::Manual => "manual",
            RefreshTrigger::Focus => "focus",
            RefreshTrigger::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every area has data.
    Completed,
    /// Published, with one or more areas unavailable.
    Partial,
    /// Nothing published; the previous snapshot stays.
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }
}

/// A source-level failure seen during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub endpoint: String,
    pub area: String,
    pub kind: ErrorKind,
    pub message: String,
    /// A cached value was served in place of live data.
    pub fallback_served: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub is_refreshing: bool,
    pub progress: Progress,
    pub errors: Vec<SourceFailure>,
    /// Set when the last run left areas unavailable.
    pub partial_failure: Option<String>,
    pub last_successful_refresh: Option<DateTime<Utc>>,
    pub last_trigger: Option<RefreshTrigger>,
    pub last_outcome: Option<RunOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub snapshot_version: u64,
}

type Callback = Arc<dyn Fn(&RefreshStatus) + Send + Sync>;
type Subscribers = Mutex<Vec<(u64, Callback)>>;

pub struct StatusBoard {
    tx: watch::Sender<RefreshStatus>,
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RefreshStatus::default());
        Self {
            tx,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> RefreshStatus {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RefreshStatus> {
        self.tx.subscribe()
    }

    /// `cb` runs after every status change, on the task that made it.
    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&RefreshStatus) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(cb)));
        Subscription {
            subscribers: Arc::downgrade(&self.subscribers),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn update(&self, f: impl FnOnce(&mut RefreshStatus)) {
        self.tx.send_modify(f);
        let status = self.current();
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(&status);
        }
    }
}

/// Callback registration; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    subscribers: Weak<Subscribers>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subs) = self.subscribers.upgrade() {
            subs.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
