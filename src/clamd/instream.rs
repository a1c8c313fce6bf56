//! INSTREAM upload
//!
//! `INSTREAM` is followed on the same socket by the payload in
//! length-prefixed chunks and a single zero-length chunk. The daemon starts
//! scanning once it sees the empty chunk and replies with one record, but it
//! may also answer early (StreamMaxLength exceeded) and hang up, so the reply
//! is drained while the upload is still running.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::response::{ScanResult, ScanResults};
use crate::common::{Error, Result};

pub const INSTREAM_COMMAND: &str = "INSTREAM";

/// Send the command, every chunk of `source`, and the terminator
///
/// Returns the number of payload bytes uploaded. Stops without sending the
/// terminator if the source fails, so the daemon never scans a silently
/// truncated upload.
pub async fn upload<R>(conn: &mut Connection, source: &mut R, chunk_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    conn.send_command(INSTREAM_COMMAND).await?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    let mut chunks = 0usize;
    loop {
        let n = source.read(&mut buf).await.map_err(Error::Source)?;
        if n == 0 {
            break;
        }
        conn.send_chunk(&buf[..n]).await?;
        total += n as u64;
        chunks += 1;
    }

    conn.send_eof().await?;
    tracing::debug!(bytes = total, chunks, "INSTREAM upload complete");
    Ok(total)
}

/// Upload `source` on `conn` and hand back the daemon's reply
///
/// Cancelling `cancel` drops the in-flight write, even mid-chunk, and
/// closes the socket. When a chunk write fails because the daemon already
/// answered and hung up, the records it sent are returned instead of the
/// write error; `reply_wait` bounds how long those are collected.
pub async fn scan<R>(
    mut conn: Connection,
    source: &mut R,
    chunk_size: usize,
    cancel: &CancellationToken,
    reply_wait: Duration,
) -> Result<ScanResults>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (results, done) = conn.read_response(None)?;

    let uploaded = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        sent = upload(&mut conn, source, chunk_size) => sent,
    };

    match uploaded {
        Ok(_) => {
            conn.close_after(done);
            Ok(results)
        }
        Err(Error::Write(e)) => {
            conn.close().await;
            let early = early_records(results, reply_wait).await;
            if early.is_empty() {
                return Err(Error::Write(e));
            }
            tracing::debug!(
                address = conn.address(),
                records = early.len(),
                error = %e,
                "clamd replied before the upload finished"
            );
            Ok(ScanResults::from_records(early))
        }
        Err(e) => {
            tracing::debug!(address = conn.address(), error = %e, "Aborting INSTREAM upload");
            drop(results);
            conn.close().await;
            Err(e)
        }
    }
}

/// Records already sent by a daemon that stopped accepting the upload
async fn early_records(mut results: ScanResults, wait: Duration) -> Vec<ScanResult> {
    let mut records = Vec::new();
    let collect = async {
        while let Some(Ok(record)) = results.next().await {
            records.push(record);
        }
    };
    if tokio::time::timeout(wait, collect).await.is_err() {
        tracing::debug!("Timed out collecting clamd reply to an aborted upload");
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clamd::response::ScanStatus;
    use crate::common::config::Framing;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    const WAIT: Duration = Duration::from_secs(5);

    struct FailingSource;

    impl AsyncRead for FailingSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "upload aborted")))
        }
    }

    async fn wire_of(source: &[u8], chunk_size: usize) -> Vec<u8> {
        let (client, mut daemon) = tokio::io::duplex(4096);
        let mut conn = Connection::from_stream(Box::new(client), "test", Framing::Newline);
        let mut src = source;
        let sent = upload(&mut conn, &mut src, chunk_size).await.unwrap();
        assert_eq!(sent, source.len() as u64);
        conn.close().await;

        let mut wire = Vec::new();
        daemon.read_to_end(&mut wire).await.unwrap();
        wire
    }

    #[tokio::test]
    async fn test_upload_splits_into_chunks() {
        let wire = wire_of(b"abcdefg", 3).await;
        assert_eq!(
            wire,
            b"nINSTREAM\n\0\0\0\x03abc\0\0\0\x03def\0\0\0\x01g\0\0\0\0".to_vec()
        );
    }

    #[tokio::test]
    async fn test_empty_source_sends_only_terminator() {
        let wire = wire_of(b"", 1024).await;
        assert_eq!(wire, b"nINSTREAM\n\0\0\0\0".to_vec());
    }

    #[tokio::test]
    async fn test_source_error_skips_terminator() {
        let (client, mut daemon) = tokio::io::duplex(4096);
        let mut conn = Connection::from_stream(Box::new(client), "test", Framing::Newline);
        let err = upload(&mut conn, &mut FailingSource, 16).await.unwrap_err();
        assert!(matches!(err, Error::Source(_)));
        conn.close().await;

        let mut wire = Vec::new();
        daemon.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, b"nINSTREAM\n".to_vec());
    }

    #[tokio::test]
    async fn test_reply_sent_before_upload_finishes_is_kept() {
        let (client, mut daemon) = tokio::io::duplex(256);
        let conn = Connection::from_stream(Box::new(client), "test", Framing::Newline);

        // Answers after the command and hangs up without reading any chunk.
        let daemon_task = tokio::spawn(async move {
            let mut command = [0u8; 10];
            daemon.read_exact(&mut command).await.unwrap();
            assert_eq!(&command, b"nINSTREAM\n");
            daemon
                .write_all(b"INSTREAM size limit exceeded. ERROR\n")
                .await
                .unwrap();
        });

        let mut source = tokio::io::repeat(b'a').take(64 * 1024);
        let records = tokio::time::timeout(
            WAIT,
            scan(conn, &mut source, 128, &CancellationToken::new(), WAIT),
        )
        .await
        .unwrap()
        .unwrap()
        .collect_all()
        .await
        .unwrap();
        daemon_task.await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ScanStatus::Error);
        assert_eq!(records[0].description, "INSTREAM size limit exceeded");
    }

    #[tokio::test]
    async fn test_write_failure_without_reply_is_write_error() {
        let (client, mut daemon) = tokio::io::duplex(256);
        let conn = Connection::from_stream(Box::new(client), "test", Framing::Newline);

        let daemon_task = tokio::spawn(async move {
            let mut command = [0u8; 10];
            daemon.read_exact(&mut command).await.unwrap();
        });

        let mut source = tokio::io::repeat(b'a').take(64 * 1024);
        let result = tokio::time::timeout(
            WAIT,
            scan(conn, &mut source, 128, &CancellationToken::new(), WAIT),
        )
        .await
        .unwrap();
        daemon_task.await.unwrap();

        assert!(matches!(result, Err(Error::Write(_))));
    }

    #[tokio::test]
    async fn test_cancel_while_chunk_write_is_blocked() {
        // The daemon never reads, so the first 1024-byte chunk cannot fit.
        let (client, mut daemon) = tokio::io::duplex(64);
        let conn = Connection::from_stream(Box::new(client), "test", Framing::Newline);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut source = tokio::io::repeat(b'a');
        let result = tokio::time::timeout(WAIT, scan(conn, &mut source, 1024, &cancel, WAIT))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // Our side is shut down: the daemon sees a partial chunk, then EOF.
        let mut wire = Vec::new();
        tokio::time::timeout(WAIT, daemon.read_to_end(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert!(wire.starts_with(b"nINSTREAM\n\0\0\x04\0"));
        assert!(wire.len() < 10 + 4 + 1024);
    }
}
