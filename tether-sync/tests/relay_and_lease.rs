//! Relay staging order and shared-lease accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use tether_core::{schema, OwnerId, Record, RowId, TableName, TableSchema};
use tether_store::{Conditions, RecordStore, Rows, SqliteRecordStore, StoreError};
use tether_sync::{
    LeaseError, ListenerId, RelayError, RelayIngester, RelayMessage, RelaySource, RelayToken,
    ServiceRefCounter, SourceError, Subsystem,
};

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Delegates to an in-memory store but rejects every write.
struct ReadOnlyStore(SqliteRecordStore);

fn refused() -> StoreError {
    StoreError::Io {
        path: "store/records.db".into(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
    }
}

impl RecordStore for ReadOnlyStore {
    fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>, StoreError> {
        self.0.create_table(schema)
    }
    fn schema(&self, table: &TableName) -> Option<Arc<TableSchema>> {
        self.0.schema(table)
    }
    fn insert(&self, _: &TableName, _: Record) -> Result<RowId, StoreError> {
        Err(refused())
    }
    fn fetch(&self, table: &TableName, limit: usize, c: &Conditions) -> Result<Rows, StoreError> {
        self.0.fetch(table, limit, c)
    }
    fn update(&self, _: &TableName, _: Record, _: &Conditions) -> Result<usize, StoreError> {
        Err(refused())
    }
    fn erase(&self, _: &TableName, _: &Conditions) -> Result<usize, StoreError> {
        Err(refused())
    }
    fn upsert(&self, _: &TableName, _: &Conditions, _: Record) -> Result<RowId, StoreError> {
        Err(refused())
    }
    fn count(&self, table: &TableName, c: &Conditions) -> Result<usize, StoreError> {
        self.0.count(table, c)
    }
    fn owners(&self, table: &TableName) -> Result<Vec<OwnerId>, StoreError> {
        self.0.owners(table)
    }
}

#[derive(Default)]
struct MockSource {
    purged: Mutex<Vec<RelayToken>>,
    broken: bool,
}

#[async_trait]
impl RelaySource for MockSource {
    async fn purge(&self, token: &RelayToken) -> Result<(), SourceError> {
        if self.broken {
            return Err(SourceError::Unavailable("companion unreachable".into()));
        }
        self.purged.lock().unwrap().push(token.clone());
        Ok(())
    }
}

fn heartbeat(seq: u64) -> RelayMessage {
    RelayMessage {
        table: schema::SENSORS.into(),
        fields: json!({"owner": "P1", "timestamp": 1_000 + seq, "heart_rate": 64})
            .as_object()
            .cloned()
            .expect("object"),
        token: RelayToken {
            source_device: "watch".into(),
            sequence: seq,
        },
    }
}

fn sensors() -> TableName {
    TableName::from(schema::SENSORS)
}

#[tokio::test]
async fn staging_failure_leaves_source_unpurged() {
    let inner = SqliteRecordStore::in_memory()
        .expect("store")
        .with_tables(schema::builtin())
        .expect("tables");
    let ingester = RelayIngester::new(Arc::new(ReadOnlyStore(inner)));
    let source = MockSource::default();

    let err = ingester.ingest(heartbeat(1), &source).await.unwrap_err();

    assert!(matches!(err, RelayError::Staging { .. }), "got {err:?}");
    assert!(source.purged.lock().unwrap().is_empty());
}

#[tokio::test]
async fn purge_failure_keeps_staged_row_eligible_for_upload() {
    let store = Arc::new(
        SqliteRecordStore::in_memory()
            .expect("store")
            .with_tables(schema::builtin())
            .expect("tables"),
    );
    let ingester = RelayIngester::new(store.clone());
    let broken = MockSource {
        broken: true,
        ..Default::default()
    };

    let err = ingester.ingest(heartbeat(4), &broken).await.unwrap_err();
    assert!(matches!(err, RelayError::Purge { .. }));

    let pending = Conditions::new().eq("committed", false);
    assert_eq!(store.count(&sensors(), &pending).expect("count"), 1);

    // Redelivery after the failed purge duplicates the row; nothing is lost.
    let ok = MockSource::default();
    ingester.ingest(heartbeat(4), &ok).await.expect("redelivery");
    assert_eq!(store.count(&sensors(), &pending).expect("count"), 2);
    assert_eq!(ok.purged.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

struct CountingProbe {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Subsystem for CountingProbe {
    async fn is_running(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        true
    }
}

#[tokio::test(start_paused = true)]
async fn n_acquires_probe_once_and_n_releases_drain_to_zero() {
    const N: usize = 16;
    let calls = Arc::new(AtomicUsize::new(0));
    let leases = ServiceRefCounter::new(
        CountingProbe {
            calls: calls.clone(),
        },
        Duration::from_secs(1),
    );
    let ids: Vec<ListenerId> = (0..N).map(|i| ListenerId(format!("listener-{i}"))).collect();

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let leases = leases.clone();
            tokio::spawn(async move { leases.acquire(id).await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join").expect("acquire");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(leases.active_count(), N);

    for id in &ids {
        leases.release(id).expect("release");
    }
    assert_eq!(leases.active_count(), 0);

    // The next 0 -> n transition probes again, exactly once.
    leases.acquire(ids[0].clone()).await.expect("reacquire");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn releasing_an_unknown_listener_changes_nothing() {
    let leases = ServiceRefCounter::new(
        CountingProbe {
            calls: Arc::new(AtomicUsize::new(0)),
        },
        Duration::from_secs(1),
    );
    leases.acquire(ListenerId::from("a")).await.expect("acquire");

    let stranger = ListenerId::from("b");
    assert_eq!(
        leases.release(&stranger),
        Err(LeaseError::NotHeld(stranger.clone()))
    );
    assert_eq!(leases.active_count(), 1);
}
