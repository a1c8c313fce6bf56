//! Decoding of clamd reply records
//!
//! Scan replies follow `<path>: [<description> ]<STATUS>`, where the path
//! ends at the first `": "` and a FOUND description may end in
//! `(<hash>:<size>)`.
//! Everything else (PONG, version strings, STATS lines) is passed through
//! with status `PARSE ERROR` so scalar commands can inspect `raw`.

use std::fmt;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;

use super::codec::ResponseCodec;
use crate::common::{Error, Result};

static RECORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<path>.+?): (?:(?P<desc>.+) )?(?P<status>FOUND|ERROR|OK)$")
        .expect("record pattern should compile")
});

static SIGNATURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+?)\((?P<hash>[^():]+):(?P<size>\d+)\)$")
        .expect("signature pattern should compile")
});

const SIZE_LIMIT_RECORD: &str = "INSTREAM size limit exceeded. ERROR";

/// Status of one decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FOUND")]
    Found,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "PARSE ERROR")]
    ParseError,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Ok => "OK",
            ScanStatus::Found => "FOUND",
            ScanStatus::Error => "ERROR",
            ScanStatus::ParseError => "PARSE ERROR",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of a clamd reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Record text as received, without its delimiter
    pub raw: String,
    /// Signature name or error text
    pub description: String,
    pub path: String,
    pub hash: String,
    /// Declared size in bytes, when the daemon reports one
    pub size: Option<u64>,
    pub status: ScanStatus,
}

impl ScanResult {
    fn unparsed(raw: String) -> Self {
        Self {
            raw,
            description: String::new(),
            path: String::new(),
            hash: String::new(),
            size: None,
            status: ScanStatus::ParseError,
        }
    }

    /// Decode one reply record
    ///
    /// Never fails: text outside the scan grammar yields `PARSE ERROR`.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();

        if raw == SIZE_LIMIT_RECORD {
            return Self {
                description: "INSTREAM size limit exceeded".to_string(),
                status: ScanStatus::Error,
                ..Self::unparsed(raw)
            };
        }

        let Some(caps) = RECORD_PATTERN.captures(&raw) else {
            return Self::unparsed(raw);
        };

        let field = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        let status = match caps.name("status").map(|m| m.as_str()) {
            Some("FOUND") => ScanStatus::Found,
            Some("ERROR") => ScanStatus::Error,
            _ => ScanStatus::Ok,
        };
        let path = field("path");
        let desc = field("desc");

        // Only a detection carries the `(hash:size)` suffix.
        let signature = (status == ScanStatus::Found)
            .then(|| SIGNATURE_PATTERN.captures(&desc))
            .flatten()
            .map(|sig| {
                (
                    sig["name"].to_string(),
                    sig["hash"].to_string(),
                    sig["size"].parse::<u64>().ok(),
                )
            });
        let (description, hash, size) = match signature {
            Some(parts) => parts,
            None => (desc, String::new(), None),
        };

        // A detection must name its signature and a clean file carries none.
        let consistent = match status {
            ScanStatus::Found => !description.is_empty(),
            ScanStatus::Ok => description.is_empty(),
            _ => true,
        };
        if !consistent {
            return Self::unparsed(raw);
        }

        Self {
            raw,
            description,
            path,
            hash,
            size,
            status,
        }
    }

    pub fn is_infected(&self) -> bool {
        self.status == ScanStatus::Found
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Ordered stream of records from one clamd exchange
///
/// Backed by a single-slot channel: the drain task reads the next record
/// from the socket only after the previous one was taken.
pub struct ScanResults {
    rx: mpsc::Receiver<Result<ScanResult>>,
}

impl ScanResults {
    pub(crate) fn new(rx: mpsc::Receiver<Result<ScanResult>>) -> Self {
        Self { rx }
    }

    /// Build a finished stream from already decoded records
    pub fn from_records(records: Vec<ScanResult>) -> Self {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            let _ = tx.try_send(Ok(record));
        }
        Self { rx }
    }

    /// Next record in daemon order, `None` once the reply is drained
    pub async fn next(&mut self) -> Option<Result<ScanResult>> {
        self.rx.recv().await
    }

    /// Drain the whole reply
    ///
    /// A mid-reply read failure discards the records gathered so far.
    pub async fn collect_all(mut self) -> Result<Vec<ScanResult>> {
        let mut records = Vec::new();
        while let Some(record) = self.rx.recv().await {
            records.push(record?);
        }
        Ok(records)
    }
}

impl Stream for ScanResults {
    type Item = Result<ScanResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for ScanResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanResults").finish_non_exhaustive()
    }
}

/// Signalled once the drain task stops reading the socket
pub type DrainComplete = oneshot::Receiver<()>;

/// Start draining `reader` on a background task
///
/// Records are forwarded in arrival order. Draining stops at end of stream,
/// after `terminator` is emitted, on a read error, or when the receiver is
/// dropped. The completion signal fires exactly once, after the reader has
/// been released.
pub fn spawn_drain<R>(reader: R, terminator: Option<&'static str>) -> (ScanResults, DrainComplete)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        drain(reader, terminator, &tx).await;
        let _ = done_tx.send(());
    });

    (ScanResults::new(rx), done_rx)
}

async fn drain<R>(reader: R, terminator: Option<&'static str>, tx: &mpsc::Sender<Result<ScanResult>>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, ResponseCodec::new());
    let mut count = 0usize;

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = tx.closed() => {
                tracing::debug!("Record receiver dropped, stopping drain");
                return;
            }
        };
        let Some(frame) = frame else { break };

        match frame {
            Ok(raw) => {
                let result = ScanResult::parse(raw);
                tracing::trace!(record = %result.raw, status = %result.status, "Decoded clamd record");
                let done = terminator.is_some_and(|t| result.raw == t);
                count += 1;
                if tx.send(Ok(result)).await.is_err() {
                    tracing::debug!("Record receiver dropped, stopping drain");
                    return;
                }
                if done {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "clamd reply read failed");
                let _ = tx.send(Err(Error::Read(e))).await;
                return;
            }
        }
    }

    tracing::debug!(records = count, "clamd reply drained");
}

/// Verdict folded from the records of one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub detected: bool,
    /// Signature names of every detection, in reply order
    pub malware: Vec<String>,
    pub records: Vec<ScanResult>,
}

impl ScanReport {
    pub fn from_records(records: Vec<ScanResult>) -> Self {
        let malware: Vec<String> = records
            .iter()
            .filter(|r| r.is_infected())
            .map(|r| r.description.clone())
            .collect();
        Self {
            detected: !malware.is_empty(),
            malware,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_clean_stream() {
        let r = ScanResult::parse("stream: OK");
        assert_eq!(r.status, ScanStatus::Ok);
        assert_eq!(r.path, "stream");
        assert!(r.description.is_empty());
        assert_eq!(r.size, None);
    }

    #[test]
    fn test_parse_found() {
        let r = ScanResult::parse("/tmp/eicar.com: Win.Test.EICAR_HDB-1 FOUND");
        assert_eq!(r.status, ScanStatus::Found);
        assert_eq!(r.path, "/tmp/eicar.com");
        assert_eq!(r.description, "Win.Test.EICAR_HDB-1");
        assert!(r.is_infected());
    }

    #[test]
    fn test_parse_found_with_hash_and_size() {
        let r = ScanResult::parse(
            "stream: Eicar-Signature(44d88612fea8a8f36de82e1278abb02f:68) FOUND",
        );
        assert_eq!(r.status, ScanStatus::Found);
        assert_eq!(r.description, "Eicar-Signature");
        assert_eq!(r.hash, "44d88612fea8a8f36de82e1278abb02f");
        assert_eq!(r.size, Some(68));
    }

    #[test]
    fn test_parse_error_record() {
        let r = ScanResult::parse("/root/secret: Access denied. ERROR");
        assert_eq!(r.status, ScanStatus::Error);
        assert_eq!(r.description, "Access denied.");
        assert_eq!(r.path, "/root/secret");
    }

    #[test]
    fn test_parse_error_with_colons_in_description() {
        let r = ScanResult::parse("/nonexistent: lstat() failed: No such file or directory. ERROR");
        assert_eq!(r.status, ScanStatus::Error);
        assert_eq!(r.path, "/nonexistent");
        assert_eq!(r.description, "lstat() failed: No such file or directory.");
    }

    #[test]
    fn test_parse_path_containing_colon() {
        let r = ScanResult::parse("/data/2024-01-01T10:00.log: OK");
        assert_eq!(r.status, ScanStatus::Ok);
        assert_eq!(r.path, "/data/2024-01-01T10:00.log");
        assert!(r.description.is_empty());

        let r = ScanResult::parse("/data/a:b: Eicar FOUND");
        assert_eq!(r.status, ScanStatus::Found);
        assert_eq!(r.path, "/data/a:b");
        assert_eq!(r.description, "Eicar");
    }

    #[test]
    fn test_hash_suffix_only_split_for_detections() {
        let r = ScanResult::parse("/srv/x: Odd(thing:12) ERROR");
        assert_eq!(r.status, ScanStatus::Error);
        assert_eq!(r.description, "Odd(thing:12)");
        assert!(r.hash.is_empty());
        assert_eq!(r.size, None);
    }

    #[test]
    fn test_parse_size_limit() {
        let r = ScanResult::parse("INSTREAM size limit exceeded. ERROR");
        assert_eq!(r.status, ScanStatus::Error);
        assert_eq!(r.description, "INSTREAM size limit exceeded");
    }

    #[test]
    fn test_parse_unstructured_records() {
        for raw in ["PONG", "ClamAV 1.3.1/27400/Mon Oct 19 08:00:00 2026", "POOLS: 1", "END"] {
            let r = ScanResult::parse(raw);
            assert_eq!(r.status, ScanStatus::ParseError);
            assert_eq!(r.raw, raw);
        }
    }

    #[test]
    fn test_found_without_signature_is_parse_error() {
        let r = ScanResult::parse("stream: FOUND");
        assert_eq!(r.status, ScanStatus::ParseError);
    }

    #[test]
    fn test_ok_with_description_is_parse_error() {
        let r = ScanResult::parse("stream: surprising OK");
        assert_eq!(r.status, ScanStatus::ParseError);
    }

    #[test]
    fn test_status_serializes_like_clamd() {
        let json = serde_json::to_value(ScanResult::parse("PONG")).unwrap();
        assert_eq!(json["status"], "PARSE ERROR");
        assert_eq!(json["raw"], "PONG");
    }

    #[test]
    fn test_report_folds_detections() {
        let report = ScanReport::from_records(vec![
            ScanResult::parse("/a: OK"),
            ScanResult::parse("/b: Eicar FOUND"),
            ScanResult::parse("/c: lstat() failed. ERROR"),
        ]);
        assert!(report.detected);
        assert_eq!(report.malware, vec!["Eicar".to_string()]);
        assert_eq!(report.records.len(), 3);
    }

    #[tokio::test]
    async fn test_drain_preserves_order_and_completes() {
        let (mut daemon, client) = tokio::io::duplex(64);
        let (results, done) = spawn_drain(client, None);

        daemon
            .write_all(b"/a: OK\n/b: Eicar FOUND\n/c: OK\n")
            .await
            .unwrap();
        drop(daemon);

        let records = results.collect_all().await.unwrap();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
        done.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_stops_at_terminator() {
        let (mut daemon, client) = tokio::io::duplex(64);
        let (results, done) = spawn_drain(client, Some("END"));

        daemon.write_all(b"QUEUE: 0 items\nEND\n").await.unwrap();

        // Socket stays open; completion must come from the terminator.
        let records = results.collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].raw, "END");
        done.await.unwrap();
        drop(daemon);
    }

    #[tokio::test]
    async fn test_drain_continues_past_malformed_record() {
        let (mut daemon, client) = tokio::io::duplex(64);
        let (results, _done) = spawn_drain(client, None);

        daemon
            .write_all(b"/a: OK\ngarbage\n/c: Eicar FOUND\n")
            .await
            .unwrap();
        drop(daemon);

        let statuses: Vec<_> = results
            .collect_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(
            statuses,
            vec![ScanStatus::Ok, ScanStatus::ParseError, ScanStatus::Found]
        );
    }

    #[tokio::test]
    async fn test_results_as_stream() {
        let mut results = ScanResults::from_records(vec![
            ScanResult::parse("/a: OK"),
            ScanResult::parse("/b: OK"),
        ]);
        let first = StreamExt::next(&mut results).await.unwrap().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(results.count().await, 1);
    }
}
