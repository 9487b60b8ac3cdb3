//! Insert and commit cost on a table that already holds thousands of rows.

use std::time::{Duration, Instant};

use tempfile::TempDir;
use tether_core::{schema, Record, TableName};
use tether_store::{Conditions, RecordStore, SqliteRecordStore};

fn gps() -> TableName {
    TableName::from(schema::GPS)
}

fn fix(ts: i64) -> Record {
    Record::new()
        .with("owner", "P1")
        .with("timestamp", ts)
        .with("latitude", 52.0)
        .with("longitude", 13.0)
}

fn insert_range(store: &SqliteRecordStore, range: std::ops::Range<i64>) -> Duration {
    let started = Instant::now();
    for ts in range {
        store.insert(&gps(), fix(ts)).expect("insert");
    }
    started.elapsed()
}

#[test]
fn insert_cost_does_not_grow_with_table_size() {
    let dir = TempDir::new().expect("tempdir");
    let store = SqliteRecordStore::open(dir.path())
        .expect("open")
        .with_tables(schema::builtin())
        .expect("tables");

    let empty_table = insert_range(&store, 0..500);
    insert_range(&store, 500..6_000);
    let full_table = insert_range(&store, 6_000..6_500);

    assert!(
        full_table <= empty_table * 4 + Duration::from_millis(500),
        "500 inserts took {empty_table:?} on an empty table but {full_table:?} at 6000 rows"
    );
    assert!(
        full_table < Duration::from_secs(10),
        "500 inserts took {full_table:?}"
    );
    assert_eq!(store.count(&gps(), &Conditions::new()).expect("count"), 6_500);
}

#[test]
fn committing_one_batch_touches_only_its_rows() {
    let dir = TempDir::new().expect("tempdir");
    let store = SqliteRecordStore::open(dir.path())
        .expect("open")
        .with_tables(schema::builtin())
        .expect("tables");
    insert_range(&store, 0..3_000);

    let pending = Conditions::new().eq("committed", false).le("timestamp", 5_000i64);
    let batch: Vec<_> = store
        .fetch(&gps(), 1_000, &pending)
        .expect("fetch")
        .map(|row| row.id)
        .collect();
    assert_eq!(batch.len(), 1_000);

    let started = Instant::now();
    let committed = store
        .update(
            &gps(),
            Record::new().with("committed", true),
            &pending.clone().ids(batch),
        )
        .expect("commit");
    assert_eq!(committed, 1_000);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "committing 1000 rows took {:?}",
        started.elapsed()
    );
    assert_eq!(store.count(&gps(), &pending).expect("count"), 2_000);
}
