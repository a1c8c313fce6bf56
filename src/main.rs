//! clamctl - command-line client for the clamd daemon
//!
//! Talks the clamd wire protocol over TCP or a Unix socket. Exits with 1 on
//! errors and 2 when a scan reports a detection.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clamd::cli::{self, OutputFormat, Verdict};
use clamd::common::config::{Config, Framing};
use clamd::common::logging;
use clamd::commands::Commands;
use clamd::Clamd;

#[derive(Parser)]
#[command(name = "clamctl", about = "Client for the ClamAV clamd daemon")]
#[command(version, long_about = None)]
struct Cli {
    /// Daemon address: tcp://host:port, unix:///path or a socket path
    #[arg(long, short, global = true)]
    address: Option<String>,

    /// Command framing used on the wire
    #[arg(long, value_enum, global = true)]
    framing: Option<Framing>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    if let Some(address) = cli.address {
        config.clamd.address = address;
    }
    if let Some(framing) = cli.framing {
        config.clamd.framing = framing;
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    let clamd = Clamd::new(config.clamd);
    match cli::dispatch(&clamd, cli.command, format).await {
        Ok(Verdict::Clean) => ExitCode::SUCCESS,
        Ok(Verdict::Infected) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}
