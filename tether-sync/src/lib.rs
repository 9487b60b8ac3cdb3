//! # tether-sync
//!
//! Upload pipeline for staged telemetry.
//!
//! [`UploadCoordinator`] drains uncommitted rows in bounded batches, hands
//! them to a [`Transport`] and commits them once delivered. [`RelayIngester`]
//! stages records relayed from companion devices, and [`ServiceRefCounter`]
//! keeps shared subsystems leased while they are in use. [`Pipeline`] wires
//! all of it from a [`tether_core::Config`].

pub mod barrier;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod lease;
pub mod pipeline;
pub mod relay;
pub mod transport;

pub use barrier::{BatchTally, CompletionBarrier};
pub use coordinator::{
    PendingUpload, SessionOutcome, SessionReport, SessionState, SyncScope, SyncSettings,
    UploadCoordinator,
};
pub use error::{FormatError, LeaseError, RelayError, SourceError, SyncError, TransportError};
pub use format::{Column, ColumnFormatter, ColumnKind, FormatterRegistry, RecordFormatter};
pub use lease::{ListenerId, ServiceRefCounter, Subsystem};
pub use pipeline::{Pipeline, SyncRun};
pub use relay::{FileSource, RelayIngester, RelayMessage, RelayOutcome, RelaySource, RelayToken};
pub use transport::{destination_path, transport_for, HttpTransport, SpoolTransport, Transport};

pub use tokio_util::sync::CancellationToken;
