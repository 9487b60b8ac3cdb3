//! `tether init --device <tag> [--owner <id>]... [--spool <dir> | --endpoint <url>]`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use tether_core::{
    config,
    paths::{config_path, default_spool_dir},
    Config, DeviceTag, LogFormat, OwnerId, TransportConfig,
};

/// Write the device configuration.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Location tag of this device (e.g. "phone").
    #[arg(long, short = 'd')]
    pub device: String,

    /// Owner to enumerate even before it has rows. Repeatable.
    #[arg(long = "owner", short = 'o', value_name = "ID")]
    pub owners: Vec<String>,

    /// Spool directory for finished batches (default ~/.tether/spool).
    #[arg(long, value_name = "DIR", conflicts_with = "endpoint")]
    pub spool: Option<PathBuf>,

    /// Collection server base URL; batches are PUT under it.
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Rows per uploaded batch (1-1000).
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Daemon log format.
    #[arg(long, value_name = "pretty|json")]
    pub log_format: Option<String>,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let path = config_path(&home);
        if path.exists() && !self.force {
            bail!(
                "config already exists at {} (use --force to overwrite)",
                path.display()
            );
        }

        let transport = match (self.endpoint, self.spool) {
            (Some(endpoint), _) => TransportConfig::Http { endpoint },
            (None, Some(dir)) => TransportConfig::Spool { dir },
            (None, None) => TransportConfig::Spool {
                dir: default_spool_dir(&home),
            },
        };

        let mut config = Config::new(DeviceTag::from(self.device), transport);
        config.owners = self.owners.into_iter().map(OwnerId::from).collect();
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(format) = self.log_format.as_deref() {
            config.log_format = parse_log_format(format)?;
        }

        config::save_at(&home, &config)
            .with_context(|| format!("failed to write {}", path.display()))?;

        println!("✓ Configured device '{}'", config.device);
        match &config.transport {
            TransportConfig::Spool { dir } => println!("  Spooling to: {}", dir.display()),
            TransportConfig::Http { endpoint } => println!("  Uploading to: {endpoint}"),
        }
        println!("  Saved to: {}", path.display());
        Ok(())
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat> {
    match value.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => bail!("unknown log format '{other}'; expected: pretty, json"),
    }
}
