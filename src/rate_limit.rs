//! # Rate Limit Gate
//! Per-source admission control for outbound requests.
//!
//! A request is admitted only when
//! - the trailing 60 s window is under `max_per_minute`,
//! - the trailing 3600 s window is under `max_per_hour`,
//! - fewer than `max_concurrent` requests are in flight, and
//! - no failure backoff is in force.
//!
//! Callers that cannot be admitted queue in (priority, arrival) order and
//! only the queue head is ever admitted, so a burst of low-priority work
//! cannot starve a high-priority fetch. A full queue, or a wait longer than
//! the caller's ceiling, fails fast with [`FetchError::RateLimited`].
//!
//! All bookkeeping for a source happens under one lock, so check-and-reserve
//! is atomic even on a multi-threaded runtime.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::RateLimitPolicy;
use crate::error::FetchError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct SourceWindow {
    policy: RateLimitPolicy,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    in_flight: u32,
    /// (priority, arrival sequence)
    queue: BTreeSet<(u8, u64)>,
    backoff: Duration,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
    total_admitted: u64,
    total_rejected: u64,
}

impl SourceWindow {
    fn new(policy: RateLimitPolicy) -> Self {
        let backoff = policy.backoff_base();
        Self {
            policy,
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            in_flight: 0,
            queue: BTreeSet::new(),
            backoff,
            consecutive_failures: 0,
            blocked_until: None,
            total_admitted: 0,
            total_rejected: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.minute.front() {
            if t + MINUTE <= now {
                self.minute.pop_front();
            } else {
                break;
            }
        }
        while let Some(&t) = self.hour.front() {
            if t + HOUR <= now {
                self.hour.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// `None` when a request may start now. Otherwise the known wait;
    /// `Duration::ZERO` means "until an in-flight request finishes".
    fn wait_needed(&self, now: Instant) -> Option<Duration> {
        let mut blocked = false;
        let mut wait = Duration::ZERO;

        if let Some(until) = self.blocked_until {
            if until > now {
                blocked = true;
                wait = wait.max(until.saturating_duration_since(now));
            }
        }
        if self.minute.len() >= self.policy.max_per_minute as usize {
            blocked = true;
            if let Some(&oldest) = self.minute.front() {
                wait = wait.max((oldest + MINUTE).saturating_duration_since(now));
            }
        }
        if self.hour.len() >= self.policy.max_per_hour as usize {
            blocked = true;
            if let Some(&oldest) = self.hour.front() {
                wait = wait.max((oldest + HOUR).saturating_duration_since(now));
            }
        }
        if self.in_flight >= self.policy.max_concurrent {
            blocked = true;
        }

        blocked.then_some(wait)
    }

    fn reserve(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hour.push_back(now);
        self.in_flight += 1;
        self.total_admitted += 1;
    }
}

#[derive(Debug, Default)]
struct GateInner {
    windows: Mutex<HashMap<String, SourceWindow>>,
    released: Notify,
    seq: AtomicU64,
}

/// Result of a non-queuing admission check.
#[derive(Debug)]
pub enum Admission {
    Granted(RatePermit),
    /// Not admitted; `Duration::ZERO` means "when a slot frees up".
    Wait(Duration),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

/// Holds one in-flight slot; released on drop.
#[derive(Debug)]
pub struct RatePermit {
    inner: Arc<GateInner>,
    source_id: String,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(w) = self.inner.windows.lock().get_mut(&self.source_id) {
            w.in_flight = w.in_flight.saturating_sub(1);
        }
        self.inner.released.notify_waiters();
    }
}

/// Queue membership; removes itself if the waiting future is dropped.
struct QueueTicket {
    inner: Arc<GateInner>,
    source_id: String,
    key: (u8, u64),
    armed: bool,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(w) = self.inner.windows.lock().get_mut(&self.source_id) {
            w.queue.remove(&self.key);
        }
        self.inner.released.notify_waiters();
    }
}

/// Operator view of one source's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub source_id: String,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub queued: usize,
    pub consecutive_failures: u32,
    pub current_backoff_ms: u64,
    pub blocked_for_ms: u64,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitGate {
    inner: Arc<GateInner>,
}

impl RateLimitGate {
    pub fn new<I, S>(policies: I) -> Self
    where
        I: IntoIterator<Item = (S, RateLimitPolicy)>,
        S: Into<String>,
    {
        let gate = Self::default();
        for (id, policy) in policies {
            gate.register(id, policy);
        }
        gate
    }

    /// Add or replace a source's policy. Counters start clean.
    pub fn register(&self, source_id: impl Into<String>, policy: RateLimitPolicy) {
        self.inner
            .windows
            .lock()
            .insert(source_id.into(), SourceWindow::new(policy));
    }

    /// Admit now or report how long to wait. Never queues, and never jumps
    /// ahead of callers already waiting in [`acquire`](Self::acquire).
    pub fn admit(&self, source_id: &str) -> Result<Admission, FetchError> {
        let now = Instant::now();
        let mut windows = self.inner.windows.lock();
        let w = windows
            .get_mut(source_id)
            .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))?;
        w.prune(now);
        if !w.queue.is_empty() {
            return Ok(Admission::Wait(w.wait_needed(now).unwrap_or_default()));
        }
        match w.wait_needed(now) {
            None => {
                w.reserve(now);
                Ok(Admission::Granted(RatePermit {
                    inner: self.inner.clone(),
                    source_id: source_id.to_string(),
                }))
            }
            Some(wait) => Ok(Admission::Wait(wait)),
        }
    }

    /// Wait in the source's priority queue until admitted.
    ///
    /// Fails fast with `RateLimited` when the queue is full or when the
    /// known wait would exceed `max_wait`.
    pub async fn acquire(
        &self,
        source_id: &str,
        priority: u8,
        max_wait: Duration,
    ) -> Result<RatePermit, FetchError> {
        let mut ticket = self.enqueue(source_id, priority)?;
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let wait = {
                let mut windows = self.inner.windows.lock();
                let w = windows
                    .get_mut(source_id)
                    .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))?;
                w.prune(now);
                let at_head = w.queue.first() == Some(&ticket.key);
                match (at_head, w.wait_needed(now)) {
                    (true, None) => {
                        w.queue.remove(&ticket.key);
                        w.reserve(now);
                        ticket.armed = false;
                        drop(windows);
                        // the next waiter may be head now
                        self.inner.released.notify_waiters();
                        return Ok(RatePermit {
                            inner: self.inner.clone(),
                            source_id: source_id.to_string(),
                        });
                    }
                    (true, Some(wait)) => wait,
                    (false, _) => Duration::ZERO,
                }
            };

            if now >= deadline || (!wait.is_zero() && now + wait > deadline) {
                self.reject(source_id);
                return Err(FetchError::RateLimited {
                    source_id: source_id.to_string(),
                    retry_after: wait,
                });
            }

            let sleep_for = if wait.is_zero() {
                deadline.saturating_duration_since(now)
            } else {
                wait
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Update failure backoff. Returns the backoff now in force
    /// (`Duration::ZERO` after a success).
    ///
    /// The n-th consecutive failure blocks the source for
    /// `base * multiplier^(n-1)`, capped at the ceiling.
    pub fn record_outcome(&self, source_id: &str, success: bool) -> Duration {
        let now = Instant::now();
        let mut windows = self.inner.windows.lock();
        let Some(w) = windows.get_mut(source_id) else {
            return Duration::ZERO;
        };

        if success {
            let was_blocked = w.blocked_until.is_some();
            w.consecutive_failures = 0;
            w.backoff = w.policy.backoff_base();
            w.blocked_until = None;
            drop(windows);
            if was_blocked {
                self.inner.released.notify_waiters();
            }
            return Duration::ZERO;
        }

        w.consecutive_failures += 1;
        let ceiling = w.policy.backoff_ceiling();
        w.backoff = if w.consecutive_failures == 1 {
            w.policy.backoff_base().min(ceiling)
        } else {
            let next = w.backoff.as_secs_f64() * w.policy.backoff_multiplier;
            Duration::from_secs_f64(next.min(ceiling.as_secs_f64()))
        };
        w.blocked_until = Some(now + w.backoff);
        w.backoff
    }

    pub fn status(&self, source_id: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let mut windows = self.inner.windows.lock();
        let w = windows.get_mut(source_id)?;
        w.prune(now);
        Some(RateLimitStatus {
            source_id: source_id.to_string(),
            requests_last_minute: w.minute.len(),
            requests_last_hour: w.hour.len(),
            max_per_minute: w.policy.max_per_minute,
            max_per_hour: w.policy.max_per_hour,
            in_flight: w.in_flight,
            max_concurrent: w.policy.max_concurrent,
            queued: w.queue.len(),
            consecutive_failures: w.consecutive_failures,
            current_backoff_ms: w.backoff.as_millis() as u64,
            blocked_for_ms: w
                .blocked_until
                .map(|u| u.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
            total_admitted: w.total_admitted,
            total_rejected: w.total_rejected,
        })
    }

    fn enqueue(&self, source_id: &str, priority: u8) -> Result<QueueTicket, FetchError> {
        let mut windows = self.inner.windows.lock();
        let w = windows
            .get_mut(source_id)
            .ok_or_else(|| FetchError::UnknownSource(source_id.to_string()))?;
        if w.queue.len() >= w.policy.max_queue {
            w.total_rejected += 1;
            let retry_after = w.wait_needed(Instant::now()).unwrap_or_default();
            drop(windows);
            counter!("rate_limited_total", "source" => source_id.to_string()).increment(1);
            tracing::warn!(target: "rate_limit", source = source_id, "queue full, failing fast");
            return Err(FetchError::RateLimited {
                source_id: source_id.to_string(),
                retry_after,
            });
        }
        let key = (priority, self.inner.seq.fetch_add(1, Ordering::Relaxed));
        w.queue.insert(key);
        Ok(QueueTicket {
            inner: self.inner.clone(),
            source_id: source_id.to_string(),
            key,
            armed: true,
        })
    }

    fn reject(&self, source_id: &str) {
        if let Some(w) = self.inner.windows.lock().get_mut(source_id) {
            w.total_rejected += 1;
        }
        counter!("rate_limited_total", "source" => source_id.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn policy(per_min: u32, concurrent: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            max_per_minute: per_min,
            max_per_hour: 1_000,
            max_concurrent: concurrent,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 5_000,
            max_queue: 16,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_ceiling_reports_wait() {
        let gate = RateLimitGate::new([("alpha", policy(3, 10))]);
        let mut permits = Vec::new();
        for _ in 0..3 {
            match gate.admit("alpha").unwrap() {
                Admission::Granted(p) => permits.push(p),
                Admission::Wait(_) => panic!("should be admitted"),
            }
        }
        drop(permits);
        tokio::time::advance(Duration::from_secs(10)).await;
        match gate.admit("alpha").unwrap() {
            Admission::Wait(w) => assert_eq!(w, Duration::from_secs(50)),
            Admission::Granted(_) => panic!("minute window is full"),
        }
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(gate.admit("alpha").unwrap().is_allowed());
    }

    #[tokio::test]
    async fn concurrency_slot_is_released_on_drop() {
        let gate = RateLimitGate::new([("alpha", policy(100, 1))]);
        let first = gate.admit("alpha").unwrap();
        assert!(first.is_allowed());
        match gate.admit("alpha").unwrap() {
            Admission::Wait(w) => assert_eq!(w, Duration::ZERO),
            Admission::Granted(_) => panic!("only one in flight allowed"),
        }
        assert_eq!(gate.status("alpha").unwrap().in_flight, 1);
        drop(first);
        assert_eq!(gate.status("alpha").unwrap().in_flight, 0);
        assert!(gate.admit("alpha").unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_to_ceiling_and_resets() {
        let gate = RateLimitGate::new([("alpha", policy(100, 5))]);
        assert_eq!(gate.record_outcome("alpha", false), Duration::from_secs(1));
        assert_eq!(gate.record_outcome("alpha", false), Duration::from_secs(2));
        assert_eq!(gate.record_outcome("alpha", false), Duration::from_secs(4));
        assert_eq!(gate.record_outcome("alpha", false), Duration::from_secs(5));

        match gate.admit("alpha").unwrap() {
            Admission::Wait(w) => assert_eq!(w, Duration::from_secs(5)),
            Admission::Granted(_) => panic!("backoff in force"),
        }
        assert_eq!(gate.status("alpha").unwrap().consecutive_failures, 4);

        assert_eq!(gate.record_outcome("alpha", true), Duration::ZERO);
        assert!(gate.admit("alpha").unwrap().is_allowed());
        assert_eq!(gate.status("alpha").unwrap().current_backoff_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_beyond_ceiling_fails_fast() {
        let gate = RateLimitGate::new([("alpha", policy(1, 5))]);
        let _p = gate.acquire("alpha", 5, Duration::from_secs(5)).await.unwrap();
        let started = Instant::now();
        let err = gate
            .acquire("alpha", 5, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert_eq!(Instant::now(), started, "must not sleep before failing");
        assert_eq!(gate.status("alpha").unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_fails_fast() {
        let mut p = policy(100, 1);
        p.max_queue = 1;
        let gate = RateLimitGate::new([("alpha", p)]);
        let held = gate.acquire("alpha", 5, Duration::from_secs(60)).await.unwrap();

        let g = gate.clone();
        let waiter =
            tokio::spawn(async move { g.acquire("alpha", 5, Duration::from_secs(60)).await });
        tokio::task::yield_now().await;
        assert_eq!(gate.status("alpha").unwrap().queued, 1);

        let err = gate
            .acquire("alpha", 5, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_serves_lower_priority_number_first() {
        let gate = RateLimitGate::new([("alpha", policy(100, 1))]);
        let held = gate.acquire("alpha", 5, Duration::from_secs(60)).await.unwrap();
        let order = StdArc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, prio) in [("low", 9u8), ("high", 1u8)] {
            let g = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _p = g.acquire("alpha", prio, Duration::from_secs(60)).await.unwrap();
                order.lock().push(label);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.status("alpha").unwrap().queued, 2);

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_leaves_queue() {
        let gate = RateLimitGate::new([("alpha", policy(100, 1))]);
        let _held = gate.acquire("alpha", 5, Duration::from_secs(60)).await.unwrap();
        let g = gate.clone();
        let waiter =
            tokio::spawn(async move { g.acquire("alpha", 5, Duration::from_secs(60)).await });
        tokio::task::yield_now().await;
        assert_eq!(gate.status("alpha").unwrap().queued, 1);
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(gate.status("alpha").unwrap().queued, 0);
    }

    #[test]
    fn unknown_source_is_an_error() {
        let gate = RateLimitGate::default();
        assert!(matches!(
            gate.admit("nope"),
            Err(FetchError::UnknownSource(_))
        ));
    }
}
