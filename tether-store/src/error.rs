//! Error types for tether-store.

use std::path::PathBuf;

use thiserror::Error;

use tether_core::{FieldType, SchemaError, TableName};

/// Local persistence failures. Fatal for the call that raised them; the
/// table is left exactly as it was before the call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} has not been created")]
    UnknownTable(TableName),

    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),

    /// A table with this name already exists with different columns.
    #[error("table {table} already exists with a different schema")]
    SchemaMismatch { table: TableName },

    #[error("table {table} has no field '{field}'")]
    UnknownField { table: TableName, field: String },

    #[error("table {table}: field '{field}' expects {expected}")]
    TypeMismatch {
        table: TableName,
        field: String,
        expected: FieldType,
    },

    #[error("table {table}: required field '{field}' is missing or empty")]
    MissingField { table: TableName, field: String },

    #[error("table {table}: duplicate value for unique field '{field}'")]
    UniqueViolation { table: TableName, field: String },

    #[error("table {table}: field name '{field}' is reserved by the store")]
    ReservedField { table: TableName, field: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A recorded table schema could not be encoded or decoded.
    #[error("schema JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
