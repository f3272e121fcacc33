use async_trait::async_trait;
use fieldsync::{
    FieldStore, FixedExtension, MemoryStore, RemoteRecord, SessionState, StoreResult, SyncConfig,
    SyncEngine, SyncError, SyncReport, WatcherConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{sleep, timeout};

const VIEW_288: &str = "http://localhost:8069/web#id=288&action=28&model=ir.ui.view&view_type=form";
const VIEW_289: &str = "http://localhost:8069/web#id=289&model=ir.ui.view";

fn view(name: &str, arch: &str) -> RemoteRecord {
    RemoteRecord::default()
        .with_field("name", name)
        .with_field("arch_base", arch)
        .with_field("arch_fs", false)
}

fn memory_store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_record("ir.ui.view", 288, view("res.partner.form", "<template/>"))
            .with_record("ir.ui.view", 289, view("res.partner.tree", "<tree/>")),
    )
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig::new()
        .with_scratch_root(root)
        .with_watcher(WatcherConfig {
            debounce: Duration::from_millis(20),
            poll_interval: Some(Duration::from_millis(100)),
        })
}

fn engine(store: Arc<dyn FieldStore>, root: &Path) -> SyncEngine {
    SyncEngine::new(store, Arc::new(FixedExtension::new("xml")), config(root)).unwrap()
}

/// Waits for the first report matching `pred`, skipping others.
async fn expect_report<F>(rx: &mut broadcast::Receiver<SyncReport>, pred: F) -> SyncReport
where
    F: Fn(&SyncReport) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let report = rx.recv().await.expect("report channel closed");
            if pred(&report) {
                return report;
            }
        }
    })
    .await
    .expect("timed out waiting for report")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_edit_triggers_exactly_one_write() {
    let temp = TempDir::new().unwrap();
    let store = memory_store();
    let mut engine = engine(store.clone(), temp.path());
    let mut reports = engine.subscribe();

    let path = engine
        .open(VIEW_288, Some("arch_base"))
        .await
        .unwrap()
        .path()
        .to_path_buf();
    assert_eq!(fs::read_to_string(&path).unwrap(), "<template/>");

    fs::write(&path, "<template v2/>").unwrap();
    expect_report(&mut reports, |r| matches!(r, SyncReport::Pushed { .. })).await;

    // Let the fallback poll and any trailing events run their course.
    sleep(Duration::from_millis(300)).await;

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].entity_type, "ir.ui.view");
    assert_eq!(writes[0].id, 288);
    assert_eq!(writes[0].field, "arch_base");
    assert_eq!(writes[0].value, "<template v2/>");

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_field_creates_no_file() {
    let temp = TempDir::new().unwrap();
    let store = memory_store();
    let mut engine = engine(store.clone(), temp.path());

    let err = engine
        .open(VIEW_288, Some("nonexistent_field"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingField { .. }), "{:?}", err);
    assert!(err.is_recoverable());
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(dir_is_empty(temp.path()));

    // The same engine accepts a corrected attempt.
    engine.open(VIEW_288, Some("arch_base")).await.unwrap();
    assert_eq!(engine.state(), SessionState::Watching);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_push_failure_keeps_watching() {
    let temp = TempDir::new().unwrap();
    let store = memory_store();
    store.set_reject_writes(true);
    let mut engine = engine(store.clone(), temp.path());
    let mut reports = engine.subscribe();

    let path = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();

    fs::write(&path, "<template v2/>").unwrap();
    expect_report(&mut reports, |r| matches!(r, SyncReport::PushFailed { .. })).await;
    assert_eq!(engine.state(), SessionState::Watching);

    store.set_reject_writes(false);
    fs::write(&path, "<template v3/>").unwrap();
    let reference = engine.active().unwrap().reference().clone();
    wait_until(|| {
        store
            .record("ir.ui.view", 288)
            .and_then(|record| record.text(&reference).ok())
            .as_deref()
            == Some("<template v3/>")
    })
    .await;
    assert_eq!(engine.state(), SessionState::Watching);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_switch_removes_previous_file() {
    let temp = TempDir::new().unwrap();
    let store = memory_store();
    let mut engine = engine(store.clone(), temp.path());

    let first = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();
    let second = engine
        .switch_to(VIEW_289, None)
        .await
        .unwrap()
        .path()
        .to_path_buf();

    assert!(!first.exists());
    assert_eq!(fs::read_to_string(&second).unwrap(), "<tree/>");
    assert_eq!(engine.active().unwrap().reference().entity_id(), 289);
    assert_eq!(engine.active().unwrap().generation(), 2);

    engine.close().await.unwrap();
    assert!(dir_is_empty(temp.path()));
}

#[tokio::test]
async fn test_previous_watcher_silent_after_switch_to_same_file() {
    let temp = TempDir::new().unwrap();
    let store = memory_store();
    let mut engine = engine(store.clone(), temp.path());
    let mut reports = engine.subscribe();

    let first = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();
    // Same record again: the new session recreates the very same path.
    let second = engine
        .switch_to(VIEW_288, None)
        .await
        .unwrap()
        .path()
        .to_path_buf();
    assert_eq!(first, second);

    fs::write(&second, "<template edited/>").unwrap();
    expect_report(&mut reports, |r| matches!(r, SyncReport::Pushed { .. })).await;
    sleep(Duration::from_millis(300)).await;

    let writes = store.writes();
    assert_eq!(writes.len(), 1, "old session pushed too: {:?}", writes);
    assert_eq!(writes[0].value, "<template edited/>");

    engine.close().await.unwrap();
}

/// Store whose writes block until the test hands out permits.
struct GatedStore {
    inner: MemoryStore,
    gate: Semaphore,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new().with_record(
                "ir.ui.view",
                288,
                view("res.partner.form", "<template/>"),
            ),
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FieldStore for GatedStore {
    async fn fetch_record(&self, entity_type: &str, id: u64) -> StoreResult<Option<RemoteRecord>> {
        self.inner.fetch_record(entity_type, id).await
    }

    async fn write_field(
        &self,
        entity_type: &str,
        id: u64,
        field: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.calls.lock().unwrap().push(value.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.gate.acquire().await.unwrap().forget();
        let result = self.inner.write_field(entity_type, id, field, value).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rapid_edits_during_push_are_coalesced() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(GatedStore::new());
    let mut engine = engine(store.clone(), temp.path());
    let mut reports = engine.subscribe();

    let path: PathBuf = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();

    fs::write(&path, "<template v1/>").unwrap();
    wait_until(|| store.in_flight.load(Ordering::SeqCst) == 1).await;
    assert_eq!(engine.state(), SessionState::Pushing);

    // Two more saves while the first push is still waiting on the server.
    fs::write(&path, "<template v2/>").unwrap();
    sleep(Duration::from_millis(60)).await;
    fs::write(&path, "<template v3/>").unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(store.calls().len(), 1, "a second push started early");

    store.gate.add_permits(16);
    expect_report(&mut reports, |r| matches!(r, SyncReport::Pushed { .. })).await;
    expect_report(&mut reports, |r| matches!(r, SyncReport::Pushed { .. })).await;
    sleep(Duration::from_millis(300)).await;

    let calls = store.calls();
    assert_eq!(calls, vec!["<template v1/>", "<template v3/>"]);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(engine.state(), SessionState::Watching);

    engine.close().await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_close_waits_for_push_in_flight() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(GatedStore::new());
    let mut engine = engine(store.clone(), temp.path());

    let path = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();
    fs::write(&path, "<template v1/>").unwrap();
    wait_until(|| store.in_flight.load(Ordering::SeqCst) == 1).await;

    let releaser = {
        let store = store.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            store.gate.add_permits(16);
        })
    };
    engine.close().await.unwrap();
    releaser.await.unwrap();

    assert!(!path.exists());
    assert_eq!(store.calls(), vec!["<template v1/>"]);
    let record = store.inner.record("ir.ui.view", 288).unwrap();
    assert_eq!(
        record.get("arch_base").and_then(|v| v.as_str()),
        Some("<template v1/>")
    );
}

#[tokio::test]
async fn test_cancelled_close_recovers_on_next_close() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(GatedStore::new());
    let mut engine = engine(store.clone(), temp.path());

    let path = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();
    fs::write(&path, "<template v1/>").unwrap();
    wait_until(|| store.in_flight.load(Ordering::SeqCst) == 1).await;

    // The close blocks on the in-flight push and is abandoned.
    assert!(
        timeout(Duration::from_millis(100), engine.close())
            .await
            .is_err()
    );
    assert!(engine.active().is_none());

    engine.close().await.unwrap();
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(!path.exists());

    store.gate.add_permits(16);
    engine.open(VIEW_288, None).await.unwrap();
    assert_eq!(engine.state(), SessionState::Watching);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_unwritable_scratch_root_fails_attempt_only() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("scratch");
    fs::write(&root, "not a directory").unwrap();
    let store = memory_store();
    let mut engine = engine(store.clone(), &root);

    let err = engine.open(VIEW_288, None).await.unwrap_err();
    assert!(matches!(err, SyncError::Write { .. }), "{:?}", err);
    assert!(!err.is_recoverable());
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(engine.active().is_none());

    fs::remove_file(&root).unwrap();
    fs::create_dir(&root).unwrap();
    let path = engine.open(VIEW_288, None).await.unwrap().path().to_path_buf();
    assert!(path.starts_with(&root));
    assert_eq!(fs::read_to_string(&path).unwrap(), "<template/>");
    assert_eq!(engine.state(), SessionState::Watching);

    engine.close().await.unwrap();
    assert!(!path.exists());
}
