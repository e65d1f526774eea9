//! rbd-snap CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use rbdock::cluster::DeviceType;
use rbdock::dev::Context;
use rbdock::snap::{BatchReport, DEFAULT_PREFIX, SnapOptions, SnapshotOrchestrator};
use rbdock_common::{RbdockPaths, parse_duration};

/// rbd-snap - Filesystem-consistent snapshots of RBD images
#[derive(Parser, Debug)]
#[command(name = "rbd-snap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Snapshot name prefix
    #[arg(long, global = true, default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Block device driver for mappings (nbd or krbd)
    #[arg(long, global = true, default_value = "nbd")]
    pub device_type: DeviceType,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// rbd-snap commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Snapshot matching images, freezing mounted filesystems
    Snap {
        /// Use the prefix as the whole snapshot name
        #[arg(long)]
        omit_timestamp: bool,

        /// Skip images that are not mapped on this host
        #[arg(long)]
        only_mapped: bool,

        /// Image patterns, e.g. docker/db-*
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Remove old prefixed snapshots of matching images
    Prune {
        /// Remove snapshots older than this, e.g. 7d
        #[arg(long, value_parser = parse_duration)]
        older_than: Duration,

        /// Image patterns, e.g. docker/db-*
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Mount the newest prefixed snapshot of matching images read-only
    Mount {
        /// Directory snapshots are mounted under
        #[arg(long, env = "RBD_SNAP_DIR", default_value = "/mnt/rbd-snap")]
        mount_root: PathBuf,

        /// Filesystem type, probed when unset
        #[arg(long)]
        filesystem: Option<String>,

        /// Image patterns, e.g. docker/db-*
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let paths = RbdockPaths::new();
        let ctx = Context::host(self.device_type, paths.proc_root())?;
        let orchestrator = SnapshotOrchestrator::new(ctx);

        let report = match self.command {
            Commands::Snap {
                omit_timestamp,
                only_mapped,
                patterns,
            } => {
                let options = SnapOptions {
                    prefix: self.prefix,
                    timestamp: !omit_timestamp,
                    only_mapped,
                };
                orchestrator.snap(&patterns, &options)?
            }

            Commands::Prune {
                older_than,
                patterns,
            } => orchestrator.prune(&patterns, &self.prefix, older_than)?,

            Commands::Mount {
                mount_root,
                filesystem,
                patterns,
            } => orchestrator.mount_latest(&patterns, &self.prefix, &mount_root, filesystem.as_deref())?,
        };

        print_report(report);
        Ok(())
    }
}

fn print_report(report: BatchReport) {
    println!("{} done, {} skipped", report.completed, report.skipped);
}
