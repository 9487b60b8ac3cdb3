//! `tether sync`: upload uncommitted rows, through the daemon when it runs.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;

use tether_core::TableName;
use tether_daemon::{request_sync, DaemonError};
use tether_sync::{CancellationToken, SessionOutcome, SyncRun, SyncScope};

/// Arguments for `tether sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Restrict the session to these tables. Repeatable.
    #[arg(long = "table", short = 't', value_name = "NAME")]
    pub tables: Vec<String>,

    /// Count what would be uploaded without sending anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;

        let (run, via) = match request_sync(&home, self.tables.clone(), self.dry_run) {
            Ok(summary) => {
                let run = serde_json::from_value(summary["run"].clone())
                    .context("daemon returned an unreadable sync summary")?;
                (run, "daemon")
            }
            Err(DaemonError::DaemonNotRunning { .. }) => (self.run_in_process(&home)?, "local"),
            Err(err) => return Err(err).context("daemon sync failed"),
        };

        print_run(&run, via);
        Ok(())
    }

    fn run_in_process(&self, home: &Path) -> Result<SyncRun> {
        let pipeline = super::open_pipeline(home)?;
        let scope = if self.tables.is_empty() {
            SyncScope::All
        } else {
            SyncScope::Tables(self.tables.iter().map(|t| TableName::from(t.as_str())).collect())
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        runtime.block_on(async {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupted; finishing in-flight batches");
                    on_interrupt.cancel();
                }
            });
            pipeline
                .sync(&scope, self.dry_run, cancel)
                .await
                .context("sync failed")
        })
    }
}

fn print_run(run: &SyncRun, via: &str) {
    match run {
        SyncRun::Planned { cutoff, pending } => {
            let records: usize = pending.iter().map(|p| p.records).sum();
            let batches: usize = pending.iter().map(|p| p.batches).sum();
            if records == 0 {
                println!("[dry-run] ✓ nothing to upload (cutoff {})", format_cutoff(*cutoff));
                return;
            }
            println!(
                "[dry-run] {records} records in {batches} batches pending (cutoff {}, {via})",
                format_cutoff(*cutoff)
            );
            for p in pending.iter().filter(|p| p.records > 0) {
                println!(
                    "  ~  {}/{}  {} records, {} batches",
                    p.table, p.owner, p.records, p.batches
                );
            }
        }
        SyncRun::Uploaded(report) => {
            let headline = format!(
                "{} records in {} batches (cutoff {}, {via})",
                report.records_committed,
                report.batches_committed,
                format_cutoff(report.cutoff)
            );
            match report.outcome {
                SessionOutcome::Completed => println!("{} Uploaded {headline}", "✓".green()),
                SessionOutcome::Cancelled => {
                    println!("{} Cancelled after {headline}", "!".yellow())
                }
            }
            for path in &report.uploaded_paths {
                println!("  ✎  {path}");
            }
            for table in &report.skipped_tables {
                println!("  ·  {table} skipped (no schema or formatter)");
            }
        }
    }
}

fn format_cutoff(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}
