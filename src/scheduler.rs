// src/scheduler.rs
//! Refresh orchestration: interval timer, manual/focus/reconnect
//! triggers, and a single-flight guard around full consolidation runs.
//!
//! Runs are spawned on the runtime, so a caller that goes away does not
//! cancel the refresh; anyone calling while a run is in flight joins it
//! and receives the same final [`RefreshStatus`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::gauge;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::consolidate::{Consolidator, PartialUpdate, ProgressObserver, RefreshOptions};
use crate::error::ConsolidationError;
use crate::persist::Persistence;
use crate::status::{
    Progress, RefreshStatus, RefreshTrigger, RunOutcome, SourceFailure, StatusBoard, Subscription,
};

type RunFuture = Shared<BoxFuture<'static, RefreshStatus>>;

/// Pushes consolidation progress onto the status board as it happens.
struct StatusObserver<'a> {
    board: &'a StatusBoard,
}

impl ProgressObserver for StatusObserver<'_> {
    fn on_progress(&self, completed: usize, total: usize) {
        self.board
            .update(|st| st.progress = Progress { completed, total });
    }

    fn on_failure(&self, failure: &SourceFailure) {
        let failure = failure.clone();
        self.board.update(|st| st.errors.push(failure));
    }
}

struct SchedulerInner {
    consolidator: Arc<Consolidator>,
    status: Arc<StatusBoard>,
    persistence: Option<Persistence>,
    focus_min_interval: Duration,
    in_flight: Mutex<Option<(u64, RunFuture)>>,
    generation: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    last_success: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn new(
        consolidator: Arc<Consolidator>,
        status: Arc<StatusBoard>,
        persistence: Option<Persistence>,
        focus_min_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                consolidator,
                status,
                persistence,
                focus_min_interval,
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                timer: Mutex::new(None),
                last_success: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> RefreshStatus {
        self.inner.status.current()
    }

    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&RefreshStatus) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(cb)
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn refresh_now(&self, opts: RefreshOptions) -> RefreshStatus {
        self.refresh(RefreshTrigger::Manual, opts).await
    }

    /// Start a run, or join the one already in flight.
    pub async fn refresh(&self, trigger: RefreshTrigger, opts: RefreshOptions) -> RefreshStatus {
        let run = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some((_, running)) => {
                    tracing::debug!(
                        target: "scheduler",
                        trigger = trigger.as_str(),
                        "joining in-flight refresh"
                    );
                    running.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let inner = self.inner.clone();
                    let handle =
                        tokio::spawn(async move { inner.run(generation, trigger, opts).await });
                    let inner = self.inner.clone();
                    let run = async move {
                        match handle.await {
                            Ok(status) => status,
                            Err(err) => {
                                tracing::error!(target: "scheduler", error = %err, "refresh task died");
                                inner.clear_in_flight(generation);
                                inner.status.update(|st| {
                                    st.is_refreshing = false;
                                    st.last_outcome = Some(RunOutcome::Failed);
                                    st.finished_at = Some(Utc::now());
                                });
                                inner.status.current()
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some((generation, run.clone()));
                    run
                }
            }
        };
        run.await
    }

    /// Re-consolidate a single area outside the single-flight guard.
    pub async fn refresh_area(
        &self,
        area: &str,
        force_refresh: bool,
    ) -> Result<PartialUpdate, ConsolidationError> {
        let opts = RefreshOptions {
            areas: vec![area.to_string()],
            force_refresh,
            ..Default::default()
        };
        let update = self.inner.consolidator.consolidate_one(area, &opts).await?;
        tracing::info!(
            target: "scheduler",
            area,
            published = update.published,
            failures = update.failures.len(),
            "area refreshed"
        );
        if update.published {
            self.inner.persist_current().await;
            self.inner.mark_success();
            let version = update.snapshot_version;
            self.inner.status.update(|st| {
                st.snapshot_version = version;
                st.last_successful_refresh = Some(Utc::now());
            });
        }
        Ok(update)
    }

    /// Start the interval timer, replacing any running one. The first
    /// tick fires one full interval from now.
    pub fn start(&self, interval: Duration) {
        let me = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                me.refresh(RefreshTrigger::Interval, RefreshOptions::full())
                    .await;
            }
        });
        if let Some(old) = self.inner.timer.lock().replace(handle) {
            old.abort();
        }
        tracing::info!(target: "scheduler", interval_ms = interval.as_millis() as u64, "auto-refresh started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
            tracing::info!(target: "scheduler", "auto-refresh stopped");
        }
    }

    /// Refresh on window focus unless the last success is recent enough.
    pub async fn on_focus(&self) -> Option<RefreshStatus> {
        let recent = self
            .inner
            .last_success
            .lock()
            .is_some_and(|at| at.elapsed() < self.inner.focus_min_interval);
        if recent {
            tracing::debug!(target: "scheduler", "focus refresh skipped, data is recent");
            return None;
        }
        Some(self.refresh(RefreshTrigger::Focus, RefreshOptions::full()).await)
    }

    pub async fn on_reconnect(&self) -> RefreshStatus {
        self.refresh(RefreshTrigger::Reconnect, RefreshOptions::full())
            .await
    }
}

impl SchedulerInner {
    async fn run(
        self: Arc<Self>,
        generation: u64,
        trigger: RefreshTrigger,
        opts: RefreshOptions,
    ) -> RefreshStatus {
        let started = Utc::now();
        self.status.update(|st| {
            st.is_refreshing = true;
            st.progress = Progress::default();
            st.errors.clear();
            st.last_trigger = Some(trigger);
            st.started_at = Some(started);
            st.finished_at = None;
        });
        tracing::info!(
            target: "scheduler",
            trigger = trigger.as_str(),
            targeted = opts.is_targeted(),
            "refresh started"
        );

        let observer = StatusObserver {
            board: &self.status,
        };
        let run = self.consolidator.consolidate_all(&opts, &observer).await;

        if run.published {
            self.persist_current().await;
            self.mark_success();
        }

        let finished = Utc::now();
        let published = run.published;
        let version = run.snapshot.version;
        let outcome = run.outcome;
        let partial = run.partial_failure().map(|e| e.to_string());
        let failures = run.failures;
        let failure_count = failures.len();
        self.status.update(|st| {
            st.is_refreshing = false;
            st.errors = failures;
            st.partial_failure = partial;
            st.last_outcome = Some(outcome);
            st.finished_at = Some(finished);
            st.run_count += 1;
            if published {
                st.last_successful_refresh = Some(finished);
                st.snapshot_version = version;
            }
        });
        let status = self.status.current();
        self.clear_in_flight(generation);

        tracing::info!(
            target: "scheduler",
            trigger = trigger.as_str(),
            outcome = outcome.as_str(),
            version,
            failures = failure_count,
            elapsed_ms = (finished - started).num_milliseconds(),
            "refresh finished"
        );
        status
    }

    fn clear_in_flight(&self, generation: u64) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
            *slot = None;
        }
    }

    fn mark_success(&self) {
        *self.last_success.lock() = Some(Instant::now());
        gauge!("refresh_last_success_ts").set(Utc::now().timestamp() as f64);
    }

    async fn persist_current(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = self.consolidator.snapshot();
        if let Err(err) = persistence.save_snapshot(snapshot.version, &*snapshot).await {
            tracing::warn!(
                target: "persist",
                version = snapshot.version,
                error = %err,
                "snapshot not persisted"
            );
        }
    }
}
