//! Tether daemon: relay inbox watcher, sync processor and socket server.

pub mod companion;
mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use companion::CompanionLink;
pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, DaemonContext, RelayStats, SyncSummary};
