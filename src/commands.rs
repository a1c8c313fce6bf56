//! CLI command definitions
//!
//! Defines the clap commands for clamctl, one per clamd command.

use clap::Subcommand;
use std::path::PathBuf;

use crate::clamd::ScanMode;

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the daemon is alive
    Ping,

    /// Print program and database versions
    Version,

    /// Show scan queue, thread and memory statistics
    Stats,

    /// Reload the virus databases
    Reload,

    /// Ask the daemon to shut down
    Shutdown,

    /// Scan a file or directory on the daemon's filesystem
    Scan {
        /// Absolute path as seen by the daemon
        path: PathBuf,

        /// Scan command to use
        #[arg(long, value_enum, default_value_t = ScanMode::Scan)]
        mode: ScanMode,
    },

    /// Upload local data with INSTREAM and scan it
    #[command(alias = "stream")]
    Instream {
        /// File to upload; reads stdin when omitted or `-`
        file: Option<PathBuf>,

        /// Name to report for the upload (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
}
