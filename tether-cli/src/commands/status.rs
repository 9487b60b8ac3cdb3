//! `tether status`: pending and committed rows per table and owner.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use tether_core::{OwnerId, TableName, COMMITTED_FIELD, OWNER_FIELD};
use tether_store::{Conditions, RecordStore};
use tether_sync::Pipeline;

/// Arguments for `tether status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let pipeline = super::open_pipeline(&home)?;
        let report = build_report(&pipeline)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    device: String,
    pending: usize,
    committed: usize,
    tables: Vec<TableStatus>,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct TableStatus {
    #[tabled(rename = "table")]
    table: String,
    #[tabled(rename = "owner")]
    owner: String,
    #[tabled(rename = "pending")]
    pending: usize,
    #[tabled(rename = "committed")]
    committed: usize,
}

fn build_report(pipeline: &Pipeline) -> Result<StatusReport> {
    let config = pipeline.config();
    let store = pipeline.store();

    let mut rows = Vec::new();
    for table in &config.tables {
        if store.schema(table).is_none() {
            continue;
        }
        for owner in owners_of(store.as_ref(), table, &config.owners)? {
            let count = |committed: bool| {
                store
                    .count(
                        table,
                        &Conditions::new()
                            .eq(OWNER_FIELD, owner.0.as_str())
                            .eq(COMMITTED_FIELD, committed),
                    )
                    .with_context(|| format!("failed to count rows in '{table}'"))
            };
            rows.push(TableStatus {
                table: table.0.clone(),
                owner: owner.0.clone(),
                pending: count(false)?,
                committed: count(true)?,
            });
        }
    }

    Ok(StatusReport {
        device: config.device.0.clone(),
        pending: rows.iter().map(|r| r.pending).sum(),
        committed: rows.iter().map(|r| r.committed).sum(),
        tables: rows,
    })
}

/// Configured owners plus every owner that has rows, in a stable order.
fn owners_of(
    store: &dyn RecordStore,
    table: &TableName,
    configured: &[OwnerId],
) -> Result<BTreeSet<OwnerId>> {
    let mut owners: BTreeSet<OwnerId> = configured.iter().cloned().collect();
    owners.extend(
        store
            .owners(table)
            .with_context(|| format!("failed to list owners of '{table}'"))?,
    );
    Ok(owners)
}

fn print_table(report: &StatusReport) {
    println!(
        "Tether v{} | device {} | {} pending | {} committed",
        env!("CARGO_PKG_VERSION"),
        report.device.bold(),
        report.pending.to_string().yellow(),
        report.committed.to_string().green(),
    );

    if report.tables.is_empty() {
        println!("No rows staged.");
        return;
    }

    let mut table = Table::new(report.tables.clone());
    table.with(Style::rounded());
    println!("{table}");

    if report.pending > 0 {
        println!("Run 'tether sync' to upload pending rows.");
    }
}
