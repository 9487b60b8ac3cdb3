pub mod daemon;
pub mod init;
pub mod prune;
pub mod relay;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use tether_core::config;
use tether_sync::Pipeline;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Open the pipeline from the saved config.
pub(crate) fn open_pipeline(home: &Path) -> Result<Pipeline> {
    let config =
        config::load_at(home).context("failed to load config. Run `tether init` first")?;
    Pipeline::open(home, config).context("failed to open record store")
}
