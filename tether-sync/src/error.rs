//! Error types for tether-sync.

use std::path::PathBuf;

use thiserror::Error;

use tether_core::{ConfigError, RowId, TableName};
use tether_store::StoreError;

use crate::lease::ListenerId;
use crate::relay::RelayToken;

/// A batch upload that did not reach the server. The batch stays
/// uncommitted and is picked up again by the next session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upload of {path} timed out after {timeout_ms} ms")]
    Timeout { path: String, timeout_ms: u64 },

    #[error("server rejected {path} with status {status}")]
    Rejected { path: String, status: u16 },

    #[error("network error uploading {path}: {message}")]
    Network { path: String, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// No serializer is registered for a table. The table is skipped for the
/// session; other tables proceed.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("no formatter registered for table {0}")]
    UnknownTable(TableName),
}

/// All errors that can arise from an upload session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// At least one batch failed. Every acknowledged batch stays committed.
    #[error(
        "{failed_batches} batch(es) failed, {committed_batches} committed; first failure: {first}"
    )]
    PartialCommit {
        first: Box<SyncError>,
        committed_batches: usize,
        failed_batches: usize,
    },

    #[error("an upload session is already running")]
    SessionInProgress,

    #[error("background task failed: {0}")]
    Join(String),
}

/// A relay source could not drop a message it handed over.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The companion holding the message could not be reached.
    #[error("relay source unavailable: {0}")]
    Unavailable(String),
}

/// Relay ingestion failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Unknown table or malformed payload. Not transient: the message is dropped.
    #[error("relay message {token} dropped: {reason}")]
    Routing { token: RelayToken, reason: String },

    /// Staging failed; the source message was not purged.
    #[error("failed to stage relay message {token}: {source}")]
    Staging {
        token: RelayToken,
        #[source]
        source: StoreError,
    },

    /// Staging succeeded as `row`, but the source could not be purged.
    #[error("relay message {token} staged as row {row} but purge failed: {source}")]
    Purge {
        token: RelayToken,
        row: RowId,
        #[source]
        source: SourceError,
    },

    #[error("relay message could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("background task failed: {0}")]
    Join(String),
}

/// Lease bookkeeping failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("subsystem is not running")]
    Unavailable,

    #[error("subsystem status probe timed out after {timeout_ms} ms")]
    ProbeTimeout { timeout_ms: u64 },

    #[error("listener {0} holds no lease")]
    NotHeld(ListenerId),

    #[error("lease request abandoned before the probe resolved")]
    Abandoned,
}
