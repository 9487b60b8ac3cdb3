//! `tether relay <file>`: stage one relayed record.
//!
//! The file is consumed: it is purged once the record is staged. With the
//! daemon running the file is handed to its inbox instead.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;

use tether_daemon::paths::relay_inbox;
use tether_daemon::{send_request, DaemonRequest};

/// Arguments for `tether relay`.
#[derive(Args, Debug)]
pub struct RelayArgs {
    /// JSON relay message (`{"table", "fields", "token"}`).
    pub file: PathBuf,
}

impl RelayArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        if !self.file.is_file() {
            bail!("relay file not found: {}", self.file.display());
        }

        if send_request(&home, &DaemonRequest::command("status")).is_ok() {
            let queued = hand_to_inbox(&relay_inbox(&home), &self.file)?;
            println!("✓ Queued for the daemon: {}", queued.display());
            return Ok(());
        }

        let pipeline = super::open_pipeline(&home)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let outcome = runtime
            .block_on(pipeline.relay().ingest_file(&self.file))
            .with_context(|| format!("failed to relay {}", self.file.display()))?;

        println!(
            "✓ Staged {} row {} (token {})",
            outcome.table, outcome.row, outcome.token
        );
        Ok(())
    }
}

/// Move `file` into the inbox under a unique `.json` name, via a `.tmp`
/// sibling so the watcher never sees a partial file.
fn hand_to_inbox(inbox: &Path, file: &Path) -> Result<PathBuf> {
    fs::create_dir_all(inbox).with_context(|| format!("create {}", inbox.display()))?;
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("relay");
    let target = inbox.join(format!("{stem}-{}.json", Utc::now().timestamp_millis()));
    let tmp = target.with_extension("json.tmp");

    fs::copy(file, &tmp).with_context(|| format!("copy {} to inbox", file.display()))?;
    fs::rename(&tmp, &target).with_context(|| format!("rename {}", tmp.display()))?;
    fs::remove_file(file).with_context(|| format!("remove {}", file.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn hand_off_moves_file_under_json_name() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("reading.json");
        fs::write(&source, "{}").unwrap();
        let inbox = dir.path().join("inbox");

        let queued = hand_to_inbox(&inbox, &source).unwrap();

        assert!(!source.exists());
        assert_eq!(queued.extension().and_then(|e| e.to_str()), Some("json"));
        assert_eq!(fs::read_to_string(&queued).unwrap(), "{}");
        assert_eq!(fs::read_dir(&inbox).unwrap().count(), 1);
    }
}
