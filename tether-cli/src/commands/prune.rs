//! `tether prune`: erase rows the server has already acknowledged.

use anyhow::{bail, Context, Result};
use clap::Args;

use tether_core::{schema, TableName, COMMITTED_FIELD};
use tether_daemon::{send_request, DaemonRequest};
use tether_store::Conditions;

/// Arguments for `tether prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Only prune these tables. Repeatable; default is every table.
    #[arg(long = "table", short = 't', value_name = "NAME")]
    pub tables: Vec<String>,
}

impl PruneArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        if send_request(&home, &DaemonRequest::command("status")).is_ok() {
            bail!("the daemon is running; stop the daemon first (`tether daemon stop`)");
        }

        let pipeline = super::open_pipeline(&home)?;
        let tables: Vec<TableName> = if self.tables.is_empty() {
            schema::builtin_names()
        } else {
            self.tables.iter().map(|t| TableName::from(t.as_str())).collect()
        };

        let store = pipeline.store();
        let mut total = 0usize;
        for table in &tables {
            if store.schema(table).is_none() {
                bail!("unknown table '{table}'");
            }
            let erased = store
                .erase(table, &Conditions::new().eq(COMMITTED_FIELD, true))
                .with_context(|| format!("failed to prune '{table}'"))?;
            if erased > 0 {
                println!("  ✗  {table}: {erased} committed rows");
            }
            total += erased;
        }

        println!("✓ Pruned {total} committed rows");
        Ok(())
    }
}
