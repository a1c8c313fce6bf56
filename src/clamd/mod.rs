//! clamd protocol client
//!
//! Every operation opens its own connection, sends one command and hands
//! back either a decoded scalar or the reply as an ordered record stream.
//! The connection is closed in the background once the reply is drained.

pub mod codec;
pub mod connection;
pub mod instream;
pub mod response;
pub mod stats;
pub mod transport;

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::common::config::ClamdConfig;
use crate::common::{Error, Result};

pub use connection::Connection;
pub use response::{ScanReport, ScanResult, ScanResults, ScanStatus};
pub use stats::Stats;
pub use transport::Address;

/// Path scanning commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ScanMode {
    /// Archive support enabled, stops at the first virus
    #[default]
    Scan,
    /// Archive and special file support disabled
    Raw,
    /// Directory scanned with multiple threads
    Multi,
    /// Keeps scanning after a virus is found
    Cont,
    /// Reports every matching signature
    #[value(name = "allmatch")]
    AllMatch,
}

impl ScanMode {
    pub fn command(self) -> &'static str {
        match self {
            ScanMode::Scan => "SCAN",
            ScanMode::Raw => "RAWSCAN",
            ScanMode::Multi => "MULTISCAN",
            ScanMode::Cont => "CONTSCAN",
            ScanMode::AllMatch => "ALLMATCHSCAN",
        }
    }
}

/// Client for one clamd daemon
#[derive(Debug, Clone)]
pub struct Clamd {
    config: ClamdConfig,
}

impl Clamd {
    pub fn new(config: ClamdConfig) -> Self {
        Self { config }
    }

    /// Send a single command and start draining its reply
    async fn simple_command(
        &self,
        command: &str,
        terminator: Option<&'static str>,
    ) -> Result<ScanResults> {
        let mut conn = Connection::open(&self.config).await?;
        if let Err(e) = conn.send_command(command).await {
            conn.close().await;
            return Err(e);
        }
        let (results, done) = conn.read_response(terminator)?;
        conn.close_after(done);
        Ok(results)
    }

    /// Run a command whose whole reply must be exactly `expected`
    async fn expect_reply(&self, command: &str, expected: &str) -> Result<()> {
        let records = self.simple_command(command, None).await?.collect_all().await?;
        match records.as_slice() {
            [only] if only.raw == expected => Ok(()),
            [] => Err(Error::protocol(command, "<empty reply>")),
            _ => {
                let reply: Vec<&str> = records.iter().map(|r| r.raw.as_str()).collect();
                Err(Error::protocol(command, reply.join(" | ")))
            }
        }
    }

    /// Check the daemon is alive (replies `PONG`)
    pub async fn ping(&self) -> Result<()> {
        self.expect_reply("PING", "PONG").await
    }

    /// Program and database version record
    pub async fn version(&self) -> Result<ScanResult> {
        let mut results = self.simple_command("VERSION", None).await?;
        match results.next().await {
            Some(record) => record,
            None => Err(Error::protocol("VERSION", "<empty reply>")),
        }
    }

    /// Scan queue, thread and memory statistics
    pub async fn stats(&self) -> Result<Stats> {
        let results = self
            .simple_command("STATS", Some(stats::STATS_TERMINATOR))
            .await?;
        Stats::collect(results).await
    }

    /// Reload the virus databases (replies `RELOADING`)
    pub async fn reload(&self) -> Result<()> {
        self.expect_reply("RELOAD", "RELOADING").await
    }

    /// Ask the daemon to exit
    ///
    /// No acknowledgement is expected; the reply, if any, is discarded.
    pub async fn shutdown(&self) -> Result<()> {
        self.simple_command("SHUTDOWN", None).await.map(drop)
    }

    /// Scan a path on the daemon's filesystem with the given command
    ///
    /// Directory scans yield one record per file in daemon order.
    pub async fn scan_path(&self, mode: ScanMode, path: impl AsRef<Path>) -> Result<ScanResults> {
        let path = path.as_ref().to_string_lossy();
        if path.contains(['\n', '\0']) {
            return Err(Error::InvalidPath(path.into_owned()));
        }
        self.simple_command(&format!("{} {}", mode.command(), path), None)
            .await
    }

    /// `SCAN`: archive support enabled, a full path is required
    pub async fn scan_file(&self, path: impl AsRef<Path>) -> Result<ScanResults> {
        self.scan_path(ScanMode::Scan, path).await
    }

    /// `RAWSCAN`: archive and special file support disabled
    pub async fn raw_scan_file(&self, path: impl AsRef<Path>) -> Result<ScanResults> {
        self.scan_path(ScanMode::Raw, path).await
    }

    /// `MULTISCAN`: directories are scanned with multiple threads
    pub async fn multi_scan_file(&self, path: impl AsRef<Path>) -> Result<ScanResults> {
        self.scan_path(ScanMode::Multi, path).await
    }

    /// `CONTSCAN`: keep going after a virus is found
    pub async fn cont_scan_file(&self, path: impl AsRef<Path>) -> Result<ScanResults> {
        self.scan_path(ScanMode::Cont, path).await
    }

    /// `ALLMATCHSCAN`: report every matching signature
    pub async fn all_match_scan_file(&self, path: impl AsRef<Path>) -> Result<ScanResults> {
        self.scan_path(ScanMode::AllMatch, path).await
    }

    /// Upload `source` with INSTREAM and scan it
    ///
    /// Cancelling `cancel` while the upload is in progress drops the pending
    /// write and closes the socket; the call then fails with
    /// [`Error::Cancelled`] and yields no records.
    pub async fn scan_stream<R>(&self, mut source: R, cancel: &CancellationToken) -> Result<ScanResults>
    where
        R: AsyncRead + Unpin,
    {
        let conn = Connection::open(&self.config).await?;
        let reply_wait = Duration::from_secs(self.config.connect_timeout_secs);
        instream::scan(conn, &mut source, self.config.chunk_size, cancel, reply_wait).await
    }
}
