//! Tether: on-device telemetry staging and upload.
//!
//! # Usage
//!
//! ```text
//! tether init --device <tag> [--owner <id>]... [--spool <dir> | --endpoint <url>]
//! tether sync [--table <name>]... [--dry-run]
//! tether status [--json]
//! tether relay <file>
//! tether prune [--table <name>]...
//! tether daemon start|stop|status|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, init::InitArgs, prune::PruneArgs, relay::RelayArgs,
    status::StatusArgs, sync::SyncArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Stage telemetry on this device and upload it in batches",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.tether/config.yaml for this device.
    Init(InitArgs),

    /// Upload uncommitted rows, or count them with --dry-run.
    Sync(SyncArgs),

    /// Show pending and committed row counts per table and owner.
    Status(StatusArgs),

    /// Stage a relayed record file from a companion device.
    Relay(RelayArgs),

    /// Delete rows that have already been uploaded.
    Prune(PruneArgs),

    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Relay(args) => args.run(),
        Commands::Prune(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
