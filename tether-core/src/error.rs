//! Error types for tether-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::TableName;

/// Errors raised while loading, validating or saving `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// No config file has been written yet.
    #[error("config not found at {path}; run `tether init` first")]
    NotFound { path: PathBuf },

    /// The file parsed but holds values the pipeline cannot run with.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Structural problems with a table schema.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table {table}: field '{field}' declared twice")]
    DuplicateField { table: TableName, field: String },

    #[error("table {table}: required {expected} field '{field}' is missing")]
    MissingField {
        table: TableName,
        field: String,
        expected: &'static str,
    },

    #[error("table {table}: upsert key field '{field}' is not declared")]
    UnknownKeyField { table: TableName, field: String },
}
