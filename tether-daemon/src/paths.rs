use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_core::paths::tether_root;

pub use tether_core::paths::relay_inbox;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_LOG: &str = "daemon.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    tether_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    tether_root(home).join("logs")
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}

/// Relay files that could not be routed are moved here instead of retried.
pub fn relay_rejected(home: &Path) -> PathBuf {
    tether_root(home).join("relay").join("rejected")
}
