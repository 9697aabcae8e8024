// tests/consolidation.rs
//
// Full and targeted consolidation runs through DashboardCore:
// partial failure, fallback-over-blank, total failure, splicing.

mod common;

use std::time::Duration;

use humdata_core::consolidate::AreaStatus;
use humdata_core::error::{ConsolidationError, ErrorKind};
use humdata_core::quality::ContributionState;
use humdata_core::service::CacheInvalidation;
use humdata_core::status::RunOutcome;
use humdata_core::RefreshOptions;

use common::{
    config, core_with, shared_area_toml, two_area_toml, Reply, ScriptedTransport, ALPHA_URL,
    BETA_URL,
};

#[tokio::test(start_paused = true)]
async fn failed_source_without_cache_leaves_its_area_unavailable() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 100.0)])]);
    transport.script(BETA_URL, vec![Reply::timeout()]);
    let (core, _) = core_with(config(&two_area_toml()), transport.clone());

    let status = core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Partial));
    assert!(!status.is_refreshing);
    assert_eq!(status.errors.len(), 1);
    let err = &status.errors[0];
    assert_eq!(err.source_id, "beta");
    assert_eq!(err.area, "beta");
    assert_eq!(err.kind, ErrorKind::Network);
    assert!(!err.fallback_served);
    assert_eq!(
        status.partial_failure.as_deref(),
        Some("1 domain area(s) unavailable: beta")
    );

    let snap = core.snapshot();
    assert_eq!(snap.version, 1);
    let alpha = snap.area("alpha").unwrap();
    assert_eq!(alpha.status, AreaStatus::Fresh);
    assert_eq!(alpha.data.as_ref().unwrap().latest("count").unwrap().value, 100.0);
    let beta = snap.area("beta").unwrap();
    assert_eq!(beta.status, AreaStatus::Unavailable);
    assert!(beta.data.is_none());
    assert_eq!(beta.contributions[0].state, ContributionState::Failed);
    assert!(snap.data_quality < 1.0);
    assert_eq!(snap.unavailable_areas(), vec!["beta".to_string()]);
    assert_eq!(transport.calls_to(BETA_URL).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn hung_source_is_reported_instead_of_stalling_the_run() {
    let mut cfg = config(&two_area_toml());
    cfg.fetch.timeout_ms = 1_000;
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 100.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 5.0)])]);
    transport.delay(BETA_URL, Duration::from_secs(3_600));
    let (core, _) = core_with(cfg, transport);

    let started = tokio::time::Instant::now();
    let status = core.refresh_now(RefreshOptions::full()).await;
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(status.last_outcome, Some(RunOutcome::Partial));
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].source_id, "beta");
    assert_eq!(status.errors[0].kind, ErrorKind::Network);
    assert_eq!(
        core.snapshot().area("beta").unwrap().status,
        AreaStatus::Unavailable
    );
}

#[tokio::test(start_paused = true)]
async fn stale_fallback_keeps_a_shared_area_populated() {
    let transport = ScriptedTransport::new();
    transport.script(
        ALPHA_URL,
        vec![
            Reply::rows(&[("2024-01-01", 10.0)]),
            Reply::connect_refused(),
        ],
    );
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 5.0)])]);
    let (core, _) = core_with(config(&shared_area_toml("sum")), transport.clone());

    let first = core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(first.last_outcome, Some(RunOutcome::Completed));
    assert_eq!(first.partial_failure, None);
    let before = core.snapshot();
    let combined = before.area("combined").unwrap();
    assert_eq!(combined.status, AreaStatus::Fresh);
    assert_eq!(combined.data.as_ref().unwrap().latest("count").unwrap().value, 15.0);

    // both entries go stale; alpha now fails, beta still answers
    tokio::time::advance(Duration::from_secs(301)).await;
    let second = core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(second.last_outcome, Some(RunOutcome::Completed));
    assert_eq!(second.errors.len(), 1);
    assert!(second.errors[0].fallback_served);
    assert_eq!(second.errors[0].source_id, "alpha");

    let after = core.snapshot();
    assert_eq!(after.version, 2);
    let combined = after.area("combined").unwrap();
    assert_eq!(combined.status, AreaStatus::Degraded);
    let point = combined.data.as_ref().unwrap().latest("count").unwrap().clone();
    assert_eq!(point.value, 15.0);
    assert_eq!(point.sources, vec!["alpha".to_string(), "beta".to_string()]);

    let states: Vec<(String, ContributionState)> = combined
        .contributions
        .iter()
        .map(|c| (c.source_id.clone(), c.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("alpha".to_string(), ContributionState::Fallback),
            ("beta".to_string(), ContributionState::Live),
        ]
    );
    assert!(after.data_quality < before.data_quality);
}

#[tokio::test(start_paused = true)]
async fn total_failure_keeps_the_previous_snapshot() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)]), Reply::Status(500)]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)]), Reply::Status(500)]);
    let (core, _) = core_with(config(&two_area_toml()), transport);

    core.refresh_now(RefreshOptions::full()).await;
    let good = core.snapshot();
    assert_eq!(good.version, 1);

    // nothing to fall back on
    assert_eq!(core.clear_cache().await.unwrap(), 2);
    let status = core
        .refresh_now(RefreshOptions {
            force_refresh: true,
            ..RefreshOptions::default()
        })
        .await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(status.errors.len(), 2);
    assert_eq!(status.snapshot_version, 1);
    assert!(status.last_successful_refresh.is_some());

    let kept = core.snapshot();
    assert_eq!(kept.version, 1);
    assert_eq!(kept.content_hash, good.content_hash);
}

#[tokio::test(start_paused = true)]
async fn targeted_refresh_splices_only_the_named_sources() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(
        BETA_URL,
        vec![
            Reply::rows(&[("2024-01-01", 2.0)]),
            Reply::rows(&[("2024-01-01", 3.0)]),
        ],
    );
    let (core, _) = core_with(config(&two_area_toml()), transport.clone());
    core.refresh_now(RefreshOptions::full()).await;
    let alpha_before = core.snapshot().area("alpha").unwrap().clone();

    let status = core
        .refresh_now(RefreshOptions {
            sources: vec!["beta".into()],
            force_refresh: true,
            ..RefreshOptions::default()
        })
        .await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));
    assert_eq!(transport.calls_to(ALPHA_URL).len(), 1);
    assert_eq!(transport.calls_to(BETA_URL).len(), 2);

    let snap = core.snapshot();
    assert_eq!(snap.version, 2);
    assert_eq!(snap.area("alpha").unwrap(), &alpha_before);
    let beta = snap.area("beta").unwrap();
    assert_eq!(beta.data.as_ref().unwrap().latest("count").unwrap().value, 3.0);
}

#[tokio::test(start_paused = true)]
async fn targeted_and_single_area_runs_agree_on_unavailable_areas() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(
        BETA_URL,
        vec![Reply::rows(&[("2024-01-01", 2.0)]), Reply::Status(500)],
    );
    let (core, _) = core_with(config(&two_area_toml()), transport);
    core.refresh_now(RefreshOptions::full()).await;
    let beta_before = core.snapshot().area("beta").unwrap().clone();
    assert_eq!(core.clear_cache().await.unwrap(), 2);

    // only beta refreshed and it has nothing: the previous beta stays
    let status = core
        .refresh_now(RefreshOptions {
            sources: vec!["beta".into()],
            force_refresh: true,
            ..RefreshOptions::default()
        })
        .await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(core.snapshot().version, 1);
    assert_eq!(core.snapshot().area("beta").unwrap(), &beta_before);

    let update = core.refresh_area("beta").await.unwrap();
    assert!(!update.published);
    assert_eq!(update.area.status, AreaStatus::Unavailable);
    assert_eq!(update.snapshot_version, 1);
    assert_eq!(core.snapshot().area("beta").unwrap(), &beta_before);

    // beta refreshed next to a healthy area is spliced in as unavailable
    let status = core
        .refresh_now(RefreshOptions {
            sources: vec!["alpha".into(), "beta".into()],
            force_refresh: true,
            ..RefreshOptions::default()
        })
        .await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Partial));
    let snap = core.snapshot();
    assert_eq!(snap.version, 2);
    assert_eq!(snap.area("alpha").unwrap().status, AreaStatus::Fresh);
    assert_eq!(snap.area("beta").unwrap().status, AreaStatus::Unavailable);
}

#[tokio::test(start_paused = true)]
async fn refresh_area_reports_unknown_and_publishes_known() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);
    let (core, _) = core_with(config(&two_area_toml()), transport.clone());

    let err = core.refresh_area("gamma").await.unwrap_err();
    assert_eq!(err, ConsolidationError::UnknownArea("gamma".into()));

    let update = core.refresh_area("alpha").await.unwrap();
    assert!(update.published);
    assert_eq!(update.snapshot_version, 1);
    assert_eq!(update.area.status, AreaStatus::Fresh);
    assert!(transport.calls_to(BETA_URL).is_empty());

    let snap = core.snapshot();
    assert!(snap.area("alpha").is_some());
    assert!(snap.area("beta").is_none());
    assert_eq!(core.refresh_status().snapshot_version, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_sources_are_recorded_not_fetched() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);
    let (core, _) = core_with(config(&shared_area_toml("union")), transport.clone());

    assert!(core.set_source_enabled("beta", false));
    assert!(!core.set_source_enabled("zeta", false));
    let status = core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));
    assert!(status.errors.is_empty());
    assert!(transport.calls_to(BETA_URL).is_empty());

    let snap = core.snapshot();
    let combined = snap.area("combined").unwrap();
    assert_eq!(combined.status, AreaStatus::Fresh);
    let beta = combined
        .contributions
        .iter()
        .find(|c| c.source_id == "beta")
        .unwrap();
    assert_eq!(beta.state, ContributionState::Disabled);
    assert_eq!(combined.quality.freshness, 1.0);
}

#[tokio::test(start_paused = true)]
async fn cache_invalidation_forces_the_next_fetch() {
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);
    let (core, _) = core_with(config(&two_area_toml()), transport.clone());

    core.refresh_now(RefreshOptions::full()).await;
    core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(transport.call_count(), 2, "second run served from cache");

    let removed = core
        .invalidate_cache(&CacheInvalidation::Prefix("alpha:".into()))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    core.refresh_now(RefreshOptions::full()).await;
    assert_eq!(transport.calls_to(ALPHA_URL).len(), 2);
    assert_eq!(transport.calls_to(BETA_URL).len(), 1);

    let removed = core
        .invalidate_cache(&CacheInvalidation::Key("beta:counts.json".into()))
        .await
        .unwrap();
    assert_eq!(removed, 1);
}
