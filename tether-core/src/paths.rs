//! On-disk layout under `<home>/.tether/`.
//!
//! ```text
//! ~/.tether/
//!   config.yaml
//!   store/<table>.json
//!   relay/inbox/*.json
//!   spool/<category>/<owner>/...
//! ```

use std::path::{Path, PathBuf};

pub fn tether_root(home: &Path) -> PathBuf {
    home.join(".tether")
}

pub fn config_path(home: &Path) -> PathBuf {
    tether_root(home).join("config.yaml")
}

pub fn store_dir(home: &Path) -> PathBuf {
    tether_root(home).join("store")
}

pub fn relay_inbox(home: &Path) -> PathBuf {
    tether_root(home).join("relay").join("inbox")
}

pub fn default_spool_dir(home: &Path) -> PathBuf {
    tether_root(home).join("spool")
}
