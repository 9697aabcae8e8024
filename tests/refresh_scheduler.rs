// tests/refresh_scheduler.rs
//
// Refresh orchestration on a paused clock: single flight, focus and
// reconnect triggers, subscribers, the interval timer, and restart
// from persisted state.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use humdata_core::status::{Progress, RefreshTrigger, RunOutcome};
use humdata_core::store::BlobStore;
use humdata_core::RefreshOptions;

use common::{config, core_on, core_with, two_area_toml, Reply, ScriptedTransport, ALPHA_URL, BETA_URL};

fn healthy() -> Arc<ScriptedTransport> {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);
    transport
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_run() {
    let transport = healthy();
    transport.delay(ALPHA_URL, Duration::from_millis(500));
    let (core, _) = core_with(config(&two_area_toml()), transport.clone());

    let c1 = core.clone();
    let first = tokio::spawn(async move { c1.refresh_now(RefreshOptions::full()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(core.refresh_status().is_refreshing);
    let second = core.refresh_now(RefreshOptions::full()).await;
    let first = first.await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.run_count, 1);
    assert_eq!(second.last_outcome, Some(RunOutcome::Completed));
    // one fetch per source, not two full sets
    assert_eq!(transport.call_count(), 2);
    assert_eq!(core.performance_summary(Some("alpha")).sample_count, 1);
    assert_eq!(core.performance_summary(Some("beta")).sample_count, 1);
    assert_eq!(core.performance_summary(None).sample_count, 2);
}

#[tokio::test(start_paused = true)]
async fn run_survives_a_dropped_caller() {
    let transport = healthy();
    transport.delay(BETA_URL, Duration::from_millis(200));
    let (core, _) = core_with(config(&two_area_toml()), transport);

    let c1 = core.clone();
    let caller = tokio::spawn(async move { c1.refresh_now(RefreshOptions::full()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    caller.abort();

    let mut rx = core.watch_refresh();
    rx.wait_for(|s| s.run_count == 1).await.unwrap();
    assert_eq!(core.snapshot().version, 1);
}

#[tokio::test(start_paused = true)]
async fn focus_is_skipped_while_data_is_recent() {
    let (core, _) = core_with(config(&two_area_toml()), healthy());

    // nothing succeeded yet
    let status = core.on_focus().await.expect("first focus refreshes");
    assert_eq!(status.last_trigger, Some(RefreshTrigger::Focus));
    assert_eq!(status.run_count, 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(core.on_focus().await.is_none());
    assert_eq!(core.refresh_status().run_count, 1);

    tokio::time::advance(Duration::from_secs(241)).await;
    let status = core.on_focus().await.expect("focus after min interval");
    assert_eq!(status.run_count, 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_always_refreshes() {
    let (core, _) = core_with(config(&two_area_toml()), healthy());
    core.refresh_now(RefreshOptions::full()).await;
    let status = core.on_reconnect().await;
    assert_eq!(status.run_count, 2);
    assert_eq!(status.last_trigger, Some(RefreshTrigger::Reconnect));
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_progress_until_unsubscribed() {
    let (core, _) = core_with(config(&two_area_toml()), healthy());
    let seen: Arc<Mutex<Vec<(bool, Progress)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = core.subscribe_to_refresh(move |st| {
        sink.lock().unwrap().push((st.is_refreshing, st.progress));
    });

    core.refresh_now(RefreshOptions::full()).await;
    let events = seen.lock().unwrap().clone();
    assert!(events.iter().any(|(refreshing, _)| *refreshing));
    assert!(events
        .iter()
        .any(|(_, p)| *p == Progress { completed: 1, total: 2 }));
    let (refreshing, progress) = *events.last().unwrap();
    assert!(!refreshing);
    assert_eq!(progress, Progress { completed: 2, total: 2 });

    sub.unsubscribe();
    let count = seen.lock().unwrap().len();
    core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(seen.lock().unwrap().len(), count);
}

#[tokio::test(start_paused = true)]
async fn interval_timer_refreshes_until_stopped() {
    let toml = two_area_toml().replace("interval_secs = 0", "interval_secs = 60");
    let (core, _) = core_with(config(&toml), healthy());

    assert!(core.start_auto_refresh());
    assert!(core.auto_refresh_running());
    let mut rx = core.watch_refresh();
    rx.wait_for(|s| s.run_count >= 1 && !s.is_refreshing)
        .await
        .unwrap();
    assert_eq!(
        core.refresh_status().last_trigger,
        Some(RefreshTrigger::Interval)
    );

    core.stop_auto_refresh();
    assert!(!core.auto_refresh_running());
    let runs = core.refresh_status().run_count;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(core.refresh_status().run_count, runs);
}

#[tokio::test]
async fn zero_interval_disables_the_timer() {
    let (core, _) = core_with(config(&two_area_toml()), healthy());
    assert!(!core.start_auto_refresh());
    assert!(!core.auto_refresh_running());
}

#[tokio::test(start_paused = true)]
async fn restart_restores_snapshot_and_cache() {
    let (core, store) = core_with(config(&two_area_toml()), healthy());
    core.refresh_now(RefreshOptions::full()).await;
    let published = core.snapshot();

    let keys = store.keys("snapshot/").await.unwrap();
    assert!(keys.contains(&"snapshot/latest".to_string()));
    assert!(keys.contains(&"snapshot/0000000001".to_string()));
    assert_eq!(store.keys("cache/").await.unwrap().len(), 2);

    let fresh_transport = ScriptedTransport::new();
    let restarted = core_on(config(&two_area_toml()), fresh_transport.clone(), store);
    let report = restarted.bootstrap().await.unwrap();
    assert_eq!(report.restored_snapshot, Some(1));
    assert_eq!(report.cache_entries, 2);
    assert_eq!(*restarted.snapshot(), *published);
    assert_eq!(restarted.refresh_status().snapshot_version, 1);

    // restored entries are still fresh: no network on the next run
    let status = restarted.refresh_now(RefreshOptions::full()).await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));
    assert_eq!(fresh_transport.call_count(), 0);
    assert_eq!(restarted.snapshot().version, 2);
}
