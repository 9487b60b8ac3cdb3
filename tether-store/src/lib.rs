//! # tether-store
//!
//! Durable staging tables for telemetry records.
//!
//! Every row carries a boolean commit flag. Producers append rows with the
//! flag cleared; the upload pipeline reads uncommitted rows in bounded
//! batches and flips the flag once the server has acknowledged them.
//!
//! [`RecordStore`] is the contract the pipeline is written against;
//! [`SqliteRecordStore`] is the shipped implementation.

pub mod condition;
pub mod error;
pub mod sqlite_store;

use std::sync::Arc;

use tether_core::{OwnerId, Record, Row, RowId, TableName, TableSchema};

pub use condition::{CompareOp, Condition, Conditions};
pub use error::StoreError;
pub use sqlite_store::SqliteRecordStore;

/// Finite, non-restartable sequence of fetched rows in insertion order.
///
/// Rows are buffered when the fetch runs, so the sequence is unaffected by
/// writes that land while it is being consumed.
#[derive(Debug, Default)]
pub struct Rows {
    inner: std::vec::IntoIter<Row>,
}

impl Rows {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<Vec<Row>> for Rows {
    fn from(rows: Vec<Row>) -> Self {
        Self {
            inner: rows.into_iter(),
        }
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

/// Table-oriented record store.
///
/// Each call is an atomic unit: it either applies completely or leaves the
/// table untouched. No cross-call transaction is exposed.
pub trait RecordStore: Send + Sync {
    /// Create `schema`'s table, or return the cached handle if it exists.
    fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>, StoreError>;

    /// Schema of an already created table.
    fn schema(&self, table: &TableName) -> Option<Arc<TableSchema>>;

    /// Append a row with its commit flag cleared.
    fn insert(&self, table: &TableName, record: Record) -> Result<RowId, StoreError>;

    /// Up to `limit` rows matching `conditions`, oldest first.
    fn fetch(
        &self,
        table: &TableName,
        limit: usize,
        conditions: &Conditions,
    ) -> Result<Rows, StoreError>;

    /// Set `fields` on every matching row. Returns the number of rows changed.
    fn update(
        &self,
        table: &TableName,
        fields: Record,
        conditions: &Conditions,
    ) -> Result<usize, StoreError>;

    /// Delete matching rows. Returns the number removed.
    fn erase(&self, table: &TableName, conditions: &Conditions) -> Result<usize, StoreError>;

    /// Update the first row matching `key`, else insert `fields` as a new row.
    fn upsert(
        &self,
        table: &TableName,
        key: &Conditions,
        fields: Record,
    ) -> Result<RowId, StoreError>;

    /// Number of matching rows.
    fn count(&self, table: &TableName, conditions: &Conditions) -> Result<usize, StoreError>;

    /// Distinct owners present in the table, in order of first appearance.
    fn owners(&self, table: &TableName) -> Result<Vec<OwnerId>, StoreError>;
}
