// tests/persistence_file.rs
//
// The shipped config parses, and a core backed by a FileStore survives a
// restart, including a damaged `snapshot/latest`.

mod common;

use std::path::Path;
use std::sync::Arc;

use humdata_core::config::{CoreConfig, MergeStrategy};
use humdata_core::status::RunOutcome;
use humdata_core::store::{BlobStore, FileStore};
use humdata_core::{DashboardCore, RefreshOptions};

use common::{config, two_area_toml, Reply, ScriptedTransport, ALPHA_URL, BETA_URL};

#[test]
fn shipped_config_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/sources.toml");
    let cfg = CoreConfig::load_from(&path).expect("config/sources.toml is valid");

    assert_eq!(cfg.areas.len(), 6);
    assert_eq!(cfg.sources.len(), 9);
    assert!(cfg.scheduler.interval().is_some());
    assert_eq!(
        cfg.area("westbank.casualties").unwrap().merge,
        MergeStrategy::Sum
    );
    assert!(!cfg.source("who").unwrap().enabled);
    for src in &cfg.sources {
        assert!(!src.endpoints.is_empty(), "{} has no endpoints", src.id);
        for ep in &src.endpoints {
            assert!(cfg.area(&ep.area).is_some(), "{}:{}", src.id, ep.path);
        }
    }
}

async fn file_core(dir: &Path, transport: Arc<ScriptedTransport>) -> Arc<DashboardCore> {
    let store = FileStore::open(dir).await.unwrap();
    Arc::new(DashboardCore::new(config(&two_area_toml()), transport, Arc::new(store)).unwrap())
}

#[tokio::test]
async fn file_backed_core_restores_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);

    let core = file_core(tmp.path(), transport).await;
    assert_eq!(core.bootstrap().await.unwrap().restored_snapshot, None);
    core.refresh_now(RefreshOptions::full()).await;
    core.refresh_now(RefreshOptions::full()).await;
    let published = core.snapshot();
    assert_eq!(published.version, 2);
    drop(core);

    let offline = ScriptedTransport::new();
    let restarted = file_core(tmp.path(), offline.clone()).await;
    let report = restarted.bootstrap().await.unwrap();
    assert_eq!(report.restored_snapshot, Some(2));
    assert_eq!(report.cache_entries, 2);
    assert_eq!(*restarted.snapshot(), *published);

    let status = restarted.refresh_now(RefreshOptions::full()).await;
    assert_eq!(status.last_outcome, Some(RunOutcome::Completed));
    assert_eq!(offline.call_count(), 0);
}

#[tokio::test]
async fn damaged_latest_falls_back_to_version_history() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.script(ALPHA_URL, vec![Reply::rows(&[("2024-01-01", 1.0)])]);
    transport.script(BETA_URL, vec![Reply::rows(&[("2024-01-01", 2.0)])]);

    let core = file_core(tmp.path(), transport).await;
    core.refresh_now(RefreshOptions::full()).await;
    let published = core.snapshot();
    drop(core);

    let store = FileStore::open(tmp.path()).await.unwrap();
    store
        .put("snapshot/latest", b"{ truncated".to_vec())
        .await
        .unwrap();

    let restarted = file_core(tmp.path(), ScriptedTransport::new()).await;
    let report = restarted.bootstrap().await.unwrap();
    assert_eq!(report.restored_snapshot, Some(1));
    assert_eq!(*restarted.snapshot(), *published);
    // the unreadable blob is discarded
    assert!(store.get("snapshot/latest").await.unwrap().is_none());
}
