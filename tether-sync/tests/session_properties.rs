//! Upload session behaviour against an in-memory store and scripted transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tether_core::{schema, Category, OwnerId, Record, RowId, TableName, Value};
use tether_store::{Conditions, RecordStore, SqliteRecordStore};
use tether_sync::{
    CancellationToken, FormatterRegistry, SessionOutcome, SessionState, SyncError, SyncScope,
    SyncSettings, Transport, TransportError, UploadCoordinator,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Upload {
    category: Category,
    path: String,
    body: String,
}

/// Records every write; fails them all while `failing` is set.
#[derive(Default)]
struct ScriptedTransport {
    uploads: Mutex<Vec<Upload>>,
    failing: AtomicBool,
}

impl ScriptedTransport {
    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(
        &self,
        category: Category,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                path: path.to_string(),
                status: 503,
            });
        }
        self.uploads.lock().unwrap().push(Upload {
            category,
            path: path.to_string(),
            body: String::from_utf8(bytes).expect("utf8"),
        });
        Ok(())
    }
}

fn gps() -> TableName {
    TableName::from(schema::GPS)
}

fn store() -> Arc<SqliteRecordStore> {
    Arc::new(
        SqliteRecordStore::in_memory()
            .expect("store")
            .with_tables(schema::builtin())
            .expect("tables"),
    )
}

fn settings(batch_size: usize) -> SyncSettings {
    SyncSettings {
        owners: vec![OwnerId::from("P1")],
        tables: vec![gps()],
        batch_size,
        max_in_flight: 4,
        write_timeout: Duration::from_secs(5),
    }
}

fn coordinator(
    store: &Arc<SqliteRecordStore>,
    transport: Arc<dyn Transport>,
    settings: SyncSettings,
) -> UploadCoordinator {
    UploadCoordinator::new(
        store.clone(),
        transport,
        FormatterRegistry::builtin(),
        settings,
    )
}

fn fix(store: &SqliteRecordStore, owner: &str, ts: i64, lat: f64, lon: f64) -> RowId {
    store
        .insert(
            &gps(),
            Record::new()
                .with("owner", owner)
                .with("timestamp", ts)
                .with("latitude", lat)
                .with("longitude", lon),
        )
        .expect("insert")
}

fn committed(store: &SqliteRecordStore) -> usize {
    store
        .count(&gps(), &Conditions::new().eq("committed", true))
        .expect("count")
}

fn uncommitted(store: &SqliteRecordStore) -> usize {
    store
        .count(&gps(), &Conditions::new().eq("committed", false))
        .expect("count")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_gps_rows_upload_as_one_batch_and_commit() {
    let store = store();
    fix(&store, "P1", 100, 1.0, 2.0);
    fix(&store, "P1", 200, 1.1, 2.1);
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let report = coordinator
        .run_session_until(1_000, &SyncScope::All, CancellationToken::new())
        .await
        .expect("session");

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.batches_committed, 1);
    assert_eq!(report.records_committed, 2);
    assert_eq!(committed(&store), 2);

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].category, Category::Data);
    let lines: Vec<&str> = uploads[0].body.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "timestamp[s] latitude[f] longitude[f]");
    assert!(lines[1].ends_with(" 1.0 2.0"), "got {}", lines[1]);
    assert!(lines[2].ends_with(" 1.1 2.1"), "got {}", lines[2]);
}

#[tokio::test]
async fn failed_upload_leaves_rows_uncommitted_and_reports_partial_commit() {
    let store = store();
    fix(&store, "P1", 100, 1.0, 2.0);
    fix(&store, "P1", 200, 1.1, 2.1);
    let transport = Arc::new(ScriptedTransport::default());
    transport.fail(true);
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let err = coordinator
        .run_session_until(1_000, &SyncScope::All, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SyncError::PartialCommit {
            first,
            committed_batches,
            failed_batches,
        } => {
            assert!(matches!(
                *first,
                SyncError::Transport(TransportError::Rejected { status: 503, .. })
            ));
            assert_eq!(committed_batches, 0);
            assert_eq!(failed_batches, 1);
        }
        other => panic!("expected PartialCommit, got {other:?}"),
    }
    assert_eq!(uncommitted(&store), 2);
    assert_eq!(committed(&store), 0);
}

#[tokio::test]
async fn exactly_1001_rows_make_two_batches() {
    let store = store();
    for ts in 0..1001 {
        fix(&store, "P1", ts, 0.0, 0.0);
    }
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let report = coordinator
        .run_session_until(10_000, &SyncScope::All, CancellationToken::new())
        .await
        .expect("session");

    assert_eq!(report.batches_committed, 2);
    let mut sizes: Vec<usize> = transport
        .uploads()
        .iter()
        .map(|u| u.body.lines().count() - 1)
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 1000]);
    assert_eq!(committed(&store), 1001);
}

#[tokio::test]
async fn rows_after_cutoff_are_never_committed() {
    let store = store();
    fix(&store, "P1", 100, 0.0, 0.0);
    fix(&store, "P1", 500, 0.0, 0.0);
    let late = fix(&store, "P1", 501, 0.0, 0.0);
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let report = coordinator
        .run_session_until(500, &SyncScope::All, CancellationToken::new())
        .await
        .expect("session");

    assert_eq!(report.records_committed, 2);
    let late_row: Vec<_> = store
        .fetch(&gps(), 1, &Conditions::new().ids([late]))
        .expect("fetch")
        .collect();
    assert_eq!(late_row[0].record.get("committed"), Some(&Value::Boolean(false)));
}

#[tokio::test]
async fn second_session_without_new_writes_uploads_nothing() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    fix(&store, "P2", 2, 0.0, 0.0);
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let first = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .expect("first");
    assert_eq!(first.batches_committed, 2, "one batch per owner");

    let second = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .expect("second");
    assert_eq!(second.batches_committed, 0);
    assert_eq!(transport.uploads().len(), 2);
}

#[tokio::test]
async fn failed_batch_is_resent_unchanged_next_session() {
    let store = store();
    fix(&store, "P1", 10, 5.5, 6.5);
    fix(&store, "P1", 20, 7.5, 8.5);
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    transport.fail(true);
    assert!(coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .is_err());

    // A row that lands after the failed session, still inside the next cutoff.
    fix(&store, "P1", 30, 9.5, 10.5);

    transport.fail(false);
    let report = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .expect("retry");
    assert_eq!(report.records_committed, 3);

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    let body: Vec<&str> = uploads[0].body.lines().skip(1).collect();
    assert!(body[0].ends_with(" 5.5 6.5"));
    assert!(body[1].ends_with(" 7.5 8.5"));
    assert!(body[2].ends_with(" 9.5 10.5"));
}

#[tokio::test]
async fn uploaded_paths_are_unique_per_batch() {
    let store = store();
    for ts in 0..5 {
        fix(&store, "P1", ts, 0.0, 0.0);
    }
    let transport = Arc::new(ScriptedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(2));

    let report = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .expect("session");
    assert_eq!(report.batches_committed, 3);

    let mut paths: Vec<String> = transport.uploads().into_iter().map(|u| u.path).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|p| p.starts_with("P1/phone/gps/gps_")));
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

/// Never finishes a write.
struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn write(&self, _: Category, _: &str, _: Vec<u8>) -> Result<(), TransportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn write_timeout_fails_the_batch() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    let mut settings = settings(1000);
    settings.write_timeout = Duration::from_millis(50);
    let coordinator = coordinator(&store, Arc::new(StalledTransport), settings);

    let err = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .unwrap_err();
    let SyncError::PartialCommit { first, .. } = err else {
        panic!("expected PartialCommit, got {err:?}");
    };
    assert!(matches!(
        *first,
        SyncError::Transport(TransportError::Timeout { timeout_ms: 50, .. })
    ));
    assert_eq!(uncommitted(&store), 1);
}

/// Signals when a write starts and holds it until released. Bodies are
/// recorded in the order the writes started.
#[derive(Default)]
struct GatedTransport {
    started: Notify,
    release: Notify,
    bodies: Mutex<Vec<String>>,
}

impl GatedTransport {
    fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn write(&self, _: Category, _: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.bodies
            .lock()
            .unwrap()
            .push(String::from_utf8(bytes).expect("utf8"));
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Rejects every write for one owner; gates the rest.
struct OwnerRejectingTransport {
    rejected_owner: &'static str,
    rejected: Notify,
    gate: GatedTransport,
}

#[async_trait]
impl Transport for OwnerRejectingTransport {
    async fn write(
        &self,
        category: Category,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        if path.starts_with(&format!("{}/", self.rejected_owner)) {
            self.rejected.notify_one();
            return Err(TransportError::Rejected {
                path: path.to_string(),
                status: 500,
            });
        }
        self.gate.write(category, path, bytes).await
    }
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    for _ in 0..200 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn cancelled_session_finishes_in_flight_batch_only() {
    let store = store();
    for ts in 0..3 {
        fix(&store, "P1", ts, 0.0, 0.0);
    }
    let transport = Arc::new(GatedTransport::default());
    let mut settings = settings(1);
    settings.max_in_flight = 1;
    let coordinator = Arc::new(coordinator(&store, transport.clone(), settings));
    let cancel = CancellationToken::new();

    let session = tokio::spawn({
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        async move {
            coordinator
                .run_session_until(100, &SyncScope::All, cancel)
                .await
        }
    });

    transport.started.notified().await;
    cancel.cancel();
    transport.release.notify_one();

    let report = session.await.expect("join").expect("session");
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(report.batches_committed, 1);
    assert_eq!(committed(&store), 1);
    assert_eq!(uncommitted(&store), 2);
    assert_eq!(coordinator.state(), SessionState::Cancelled { cutoff: 100 });
}

#[tokio::test]
async fn cancel_after_last_batch_was_issued_still_completes() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    let transport = Arc::new(GatedTransport::default());
    let coordinator = Arc::new(coordinator(&store, transport.clone(), settings(1000)));
    let cancel = CancellationToken::new();

    let session = tokio::spawn({
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        async move {
            coordinator
                .run_session_until(100, &SyncScope::All, cancel)
                .await
        }
    });

    transport.started.notified().await;
    cancel.cancel();
    transport.release.notify_one();

    let report = session.await.expect("join").expect("session");
    assert_eq!(report.outcome, SessionOutcome::Completed, "nothing was left to stop");
    assert_eq!(report.batches_committed, 1);
    assert_eq!(uncommitted(&store), 0);
    assert_eq!(
        coordinator.state(),
        SessionState::Resolved {
            cutoff: 100,
            success: true
        }
    );
}

#[tokio::test]
async fn cancelled_session_with_failed_batch_reports_cancelled() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    fix(&store, "P1", 2, 0.0, 0.0);
    fix(&store, "P2", 3, 0.0, 0.0);
    let transport = Arc::new(OwnerRejectingTransport {
        rejected_owner: "P2",
        rejected: Notify::new(),
        gate: GatedTransport::default(),
    });
    let coordinator = Arc::new(coordinator(&store, transport.clone(), settings(1)));
    let cancel = CancellationToken::new();

    let session = tokio::spawn({
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        async move {
            coordinator
                .run_session_until(100, &SyncScope::All, cancel)
                .await
        }
    });

    transport.rejected.notified().await;
    transport.gate.started.notified().await;
    cancel.cancel();
    transport.gate.release.notify_one();

    let report = session
        .await
        .expect("join")
        .expect("a cancelled session reports instead of failing");
    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(report.batches_committed, 1);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(uncommitted(&store), 2, "P1's second row and P2's row remain");
    assert_eq!(coordinator.state(), SessionState::Cancelled { cutoff: 100 });
}

#[tokio::test]
async fn dropped_session_releases_the_coordinator() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    let transport = Arc::new(GatedTransport::default());
    let coordinator = coordinator(&store, transport.clone(), settings(1000));

    let scope = SyncScope::All;
    let mut abandoned =
        Box::pin(coordinator.run_session_until(100, &scope, CancellationToken::new()));
    tokio::select! {
        _ = &mut abandoned => panic!("a gated session cannot finish"),
        _ = transport.started.notified() => {}
    }
    assert_eq!(coordinator.state(), SessionState::Running { cutoff: 100 });
    drop(abandoned);
    assert_eq!(coordinator.state(), SessionState::Cancelled { cutoff: 100 });

    // The batch already handed to the transport still finishes and commits.
    transport.release.notify_one();
    wait_until(|| committed(&store) == 1).await;

    let report = coordinator
        .run_session_until(200, &SyncScope::All, CancellationToken::new())
        .await
        .expect("a new session starts after the old one was dropped");
    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.batches_committed, 0);
    assert_eq!(transport.bodies().len(), 1);
}

#[tokio::test]
async fn row_written_while_its_batch_is_in_flight_waits_for_its_own_batch() {
    let store = store();
    fix(&store, "P1", 10, 1.0, 1.0);
    let transport = Arc::new(GatedTransport::default());
    let coordinator = Arc::new(coordinator(&store, transport.clone(), settings(1000)));

    let session = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .run_session_until(100, &SyncScope::All, CancellationToken::new())
                .await
        }
    });

    transport.started.notified().await;
    // Inside the cutoff, but written after the first batch was read.
    let late = fix(&store, "P1", 20, 2.0, 2.0);
    transport.release.notify_one();

    transport.started.notified().await;
    let late_row: Vec<_> = store
        .fetch(&gps(), 1, &Conditions::new().ids([late]))
        .expect("fetch")
        .collect();
    assert_eq!(
        late_row[0].record.get("committed"),
        Some(&Value::Boolean(false)),
        "the first batch's commit must not cover the late row"
    );
    assert_eq!(committed(&store), 1);
    transport.release.notify_one();

    let report = session.await.expect("join").expect("session");
    assert_eq!(report.batches_committed, 2);
    assert_eq!(report.records_committed, 2);
    assert_eq!(uncommitted(&store), 0);

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 2);
    let first: Vec<&str> = bodies[0].lines().skip(1).collect();
    assert_eq!(first.len(), 1);
    assert!(first[0].ends_with(" 1.0 1.0"), "got {}", first[0]);
    let second: Vec<&str> = bodies[1].lines().skip(1).collect();
    assert_eq!(second.len(), 1);
    assert!(second[0].ends_with(" 2.0 2.0"), "got {}", second[0]);
}

#[tokio::test]
async fn overlapping_sessions_are_rejected() {
    let store = store();
    fix(&store, "P1", 1, 0.0, 0.0);
    let transport = Arc::new(GatedTransport::default());
    let coordinator = Arc::new(coordinator(&store, transport.clone(), settings(1000)));

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .run_session_until(100, &SyncScope::All, CancellationToken::new())
                .await
        }
    });
    transport.started.notified().await;

    let err = coordinator
        .run_session_until(100, &SyncScope::All, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SessionInProgress));

    transport.release.notify_one();
    first.await.expect("join").expect("first session");
}
