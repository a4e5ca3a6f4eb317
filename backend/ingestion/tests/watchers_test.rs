//! Watchers running against a real notifier and a mocked catalog

use ingestion::{
    BeamtimeWatcher, CatalogClient, DatasetPhase, DatasetWatcher, Lifecycle, MemoryReporter,
    Notifier, ReportKind, Reporter, StaticTokenProvider, WatcherContext,
};
use scingest_core::{BeamtimeDescriptor, DatasetId, IngestorConfig, UpdateStrategy};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::IngestionStateStore;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DESCRIPTOR: &str = r#"{"beamtimeId": "100", "beamline": "p01", "status": "running"}"#;

fn context(server: &MockServer, base: &Path) -> (WatcherContext, Arc<MemoryReporter>) {
    let config = IngestorConfig {
        beamtime_dirs: vec![base.to_path_buf()],
        scicat_url: server.uri(),
        update_strategy: UpdateStrategy::Mixed,
        recheck_interval_secs: 1,
        notifier_timeout_ms: 20,
        retry_delay_ms: 10,
        ..Default::default()
    };
    let catalog = CatalogClient::new(&config, Arc::new(StaticTokenProvider::new("token"))).unwrap();
    let reporter = Arc::new(MemoryReporter::new());
    let shared: Arc<dyn Reporter> = reporter.clone();
    let ctx = WatcherContext {
        notifier: Arc::new(Notifier::start(config.notifier_timeout()).unwrap()),
        config: Arc::new(config),
        catalog: Arc::new(catalog),
        reporter: shared,
    };
    (ctx, reporter)
}

async fn mount_catalog(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/datasets/.+$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

fn write_scan(base: &Path, scan: &str) {
    let raw = base.join("raw");
    fs::create_dir_all(&raw).unwrap();
    fs::write(raw.join(format!("{}.scan.json", scan)), "{}").unwrap();
}

async fn count_requests(server: &MockServer, verb: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == verb)
        .count()
}

/// Polls the recovery file until `id` is ingested.
async fn wait_until_ingested(dir: &Path, id: &DatasetId) -> bool {
    for _ in 0..100 {
        if let Ok(store) = IngestionStateStore::load(dir, "100") {
            if store.is_ingested(id) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_dataset_watcher_picks_up_new_scans() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let base = TempDir::new().unwrap();
    let base_dir = base.path().canonicalize().unwrap();
    let descriptor_path = base_dir.join("beamtime-metadata-100.json");
    fs::write(&descriptor_path, DESCRIPTOR).unwrap();
    write_scan(&base_dir, "scan_1");

    let (ctx, _reporter) = context(&server, &base_dir);
    let beamtime = BeamtimeDescriptor::from_json(&descriptor_path, DESCRIPTOR).unwrap();
    let mut watcher = DatasetWatcher::new(beamtime, ctx.clone());
    assert_eq!(watcher.phase(), DatasetPhase::Stopped);

    watcher.start().unwrap();
    assert!(watcher.running());
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for_phase(DatasetPhase::Idle))
        .await
        .unwrap();
    assert!(wait_until_ingested(&base_dir, &DatasetId::new("100", "scan_1")).await);

    write_scan(&base_dir, "scan_2");
    assert!(wait_until_ingested(&base_dir, &DatasetId::new("100", "scan_2")).await);

    watcher.stop().await;
    watcher.stop().await;
    assert!(!watcher.running());
    assert_eq!(watcher.phase(), DatasetPhase::Stopped);
    assert_eq!(ctx.notifier.registration_count(), 0);

    let posts = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == "POST")
        .count();
    assert_eq!(posts, 2);
}

#[tokio::test]
async fn test_beamtime_watcher_follows_descriptor_lifecycle() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let base = TempDir::new().unwrap();
    let base_dir = base.path().canonicalize().unwrap();
    write_scan(&base_dir, "scan_1");

    let (ctx, _reporter) = context(&server, &base_dir);
    let mut watcher = BeamtimeWatcher::new(ctx.clone());
    watcher.start().unwrap();
    watcher.start().unwrap();
    assert!(watcher.tracked().is_empty());

    let descriptor_path = base_dir.join("beamtime-metadata-100.json");
    fs::write(&descriptor_path, DESCRIPTOR).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for_tracked(|ids| ids.len() == 1),
    )
    .await
    .unwrap();
    assert_eq!(watcher.tracked(), vec!["100".to_string()]);
    assert!(wait_until_ingested(&base_dir, &DatasetId::new("100", "scan_1")).await);

    // closing the beamtime stops its watcher and reclaims the recovery file
    fs::write(
        &descriptor_path,
        r#"{"beamtimeId": "100", "beamline": "p01", "status": "closed"}"#,
    )
    .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for_tracked(|ids| ids.is_empty()),
    )
    .await
    .unwrap();
    assert!(!IngestionStateStore::file_path(&base_dir, "100").exists());

    watcher.stop().await;
    watcher.stop().await;
    assert!(!watcher.running());
    assert_eq!(ctx.notifier.registration_count(), 0);
}

#[tokio::test]
async fn test_beamtime_watcher_waits_for_missing_base_dir() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let root = TempDir::new().unwrap();
    let base_dir = root.path().canonicalize().unwrap().join("current");

    let (ctx, _reporter) = context(&server, &base_dir);
    let mut watcher = BeamtimeWatcher::new(ctx);
    watcher.start().unwrap();

    fs::create_dir_all(&base_dir).unwrap();
    fs::write(base_dir.join("beamtime-metadata-100.json"), DESCRIPTOR).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for_tracked(|ids| ids.len() == 1),
    )
    .await
    .unwrap();

    watcher.stop().await;
    assert!(watcher.tracked().is_empty());
}

#[tokio::test]
async fn test_new_file_in_scan_directory_patches_dataset() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    Mock::given(method("PATCH"))
        .and(path_regex(r"^/datasets/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let base = TempDir::new().unwrap();
    let base_dir = base.path().canonicalize().unwrap();
    let descriptor_path = base_dir.join("beamtime-metadata-100.json");
    fs::write(&descriptor_path, DESCRIPTOR).unwrap();
    write_scan(&base_dir, "scan_1");
    let scan_dir = base_dir.join("raw").join("scan_1");
    fs::create_dir_all(&scan_dir).unwrap();

    let (mut ctx, _reporter) = context(&server, &base_dir);
    let mut config = (*ctx.config).clone();
    config.watch_scan_dirs = true;
    ctx.config = Arc::new(config);

    let beamtime = BeamtimeDescriptor::from_json(&descriptor_path, DESCRIPTOR).unwrap();
    let mut watcher = DatasetWatcher::new(beamtime, ctx);
    watcher.start().unwrap();
    assert!(wait_until_ingested(&base_dir, &DatasetId::new("100", "scan_1")).await);
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_for_phase(DatasetPhase::Idle))
        .await
        .unwrap();
    assert_eq!(count_requests(&server, "PATCH").await, 0);

    fs::write(scan_dir.join("frame_0001.h5"), "data").unwrap();
    let mut patched = false;
    for _ in 0..100 {
        if count_requests(&server, "PATCH").await > 0 {
            patched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    watcher.stop().await;

    assert!(patched);
    assert_eq!(count_requests(&server, "POST").await, 1);
}

#[tokio::test]
async fn test_beamtime_watcher_restarts_dataset_watcher_after_state_error() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    let base = TempDir::new().unwrap();
    let base_dir = base.path().canonicalize().unwrap();
    fs::write(base_dir.join("beamtime-metadata-100.json"), DESCRIPTOR).unwrap();
    write_scan(&base_dir, "scan_1");
    let state_file = IngestionStateStore::file_path(&base_dir, "100");
    fs::write(&state_file, "{\"beamtimeId\": ").unwrap();

    let (ctx, reporter) = context(&server, &base_dir);
    let mut watcher = BeamtimeWatcher::new(ctx);
    watcher.start().unwrap();

    let mut reported = false;
    for _ in 0..100 {
        if reporter.count(ReportKind::StateStoreError) > 0 {
            reported = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(reported);

    // once the file is repaired the next pass brings the beamtime back
    fs::remove_file(&state_file).unwrap();
    assert!(wait_until_ingested(&base_dir, &DatasetId::new("100", "scan_1")).await);
    assert_eq!(watcher.tracked(), vec!["100".to_string()]);

    watcher.stop().await;
}
