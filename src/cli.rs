use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// snapfreeze: crash-consistent snapshot backups of a running database
#[derive(Parser, Debug)]
#[command(name = "snapfreeze", version, about = "Back up a live MySQL data directory from an LVM snapshot.", long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Log at debug level
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a backup for the backup-set file
    Backup {
        /// Backup-set configuration (JSON)
        config: PathBuf,
        /// Prompt for the MySQL password instead of reading it from the config
        #[arg(long)]
        ask_password: bool,
    },

    /// Show what a backup would do without touching anything
    DryRun {
        /// Backup-set configuration (JSON)
        config: PathBuf,
        #[arg(long)]
        ask_password: bool,
    },

    /// Print the volume backing a path
    Inspect {
        path: PathBuf,
    },

    /// Check the archive members of a finished backup against its manifest
    Verify {
        /// Backup run directory
        backup_dir: PathBuf,
    },

    /// List the finished backups of a backup set
    List {
        /// Backup-set configuration (JSON)
        config: PathBuf,
    },

    /// Print CLI version
    Version,
}
