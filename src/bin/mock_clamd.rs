//! Mock clamd daemon for manual testing
//!
//! Serves canned replies (PONG, a fixed version, sample STATS, OK for every
//! path, EICAR detection for INSTREAM) until interrupted.

use std::path::PathBuf;

use clap::Parser;
use clamd::common::logging;
use clamd::testing::MockClamd;

#[derive(Parser)]
#[command(name = "mock-clamd", about = "Scripted stand-in for the clamd daemon")]
struct Args {
    /// TCP address to listen on
    #[arg(long, default_value = "127.0.0.1:3310", conflicts_with = "unix")]
    tcp: String,

    /// Unix socket path to listen on instead of TCP
    #[arg(long)]
    unix: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logging::init_mock();
    let args = Args::parse();

    let mock = match start(&args).await {
        Ok(mock) => mock,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(address = mock.address(), "Mock clamd listening");
    println!("{}", mock.address());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for Ctrl+C: {}", e);
    }

    tracing::info!(exchanges = mock.received().len(), "Mock clamd shutting down");
    if let Some(path) = &args.unix {
        let _ = std::fs::remove_file(path);
    }
}

async fn start(args: &Args) -> std::io::Result<MockClamd> {
    match &args.unix {
        #[cfg(unix)]
        Some(path) => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            MockClamd::start_unix(path).await
        }
        #[cfg(not(unix))]
        Some(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unix sockets are not available on this platform",
        )),
        None => MockClamd::start_tcp_on(&args.tcp).await,
    }
}
