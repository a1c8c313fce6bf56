//! clamd wire codec
//!
//! Commands are single tokens wrapped in a framing prefix and delimiter:
//! ```text
//! nSCAN /path\n      (newline framing)
//! zSCAN /path\0      (null framing)
//! ```
//! INSTREAM payloads follow as `<u32 big-endian length><bytes>` chunks,
//! terminated by a zero-length chunk. Replies are records terminated by
//! `\n` or `\0`.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::common::config::Framing;

/// Longest single reply record accepted from the daemon
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Frame a command token for the wire
pub fn encode_command(framing: Framing, command: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(command.len() + 2);
    buf.push(framing.prefix());
    buf.extend_from_slice(command.as_bytes());
    buf.push(framing.delimiter());
    buf
}

/// Append one INSTREAM chunk (length prefix + payload) to `dst`
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk of {} bytes exceeds the 4-byte length prefix", data.len()),
        )
    })?;
    dst.reserve(4 + data.len());
    dst.put_u32(len);
    dst.put_slice(data);
    Ok(())
}

/// Write a framed command and flush
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    framing: Framing,
    command: &str,
) -> io::Result<()> {
    writer.write_all(&encode_command(framing, command)).await?;
    writer.flush().await
}

/// Write one length-prefixed chunk and flush
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::new();
    encode_chunk(data, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Splits daemon replies into records
///
/// Either `\n` or `\0` ends a record, whichever framing the command used.
/// A trailing `\r` is dropped and empty records are skipped.
#[derive(Debug)]
pub struct ResponseCodec {
    max_length: usize,
    /// Bytes already searched for a delimiter
    next_index: usize,
}

impl ResponseCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_RECORD_LEN)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn record_text(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

impl Decoder for ResponseCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let found = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n' || *b == 0);

            let Some(offset) = found else {
                if src.len() > self.max_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("clamd record exceeds {} bytes", self.max_length),
                    ));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let frame = src.split_to(end + 1);
            let record = record_text(&frame[..end]);
            if !record.is_empty() {
                return Ok(Some(record));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // Daemon closed without a final delimiter
        let frame = src.split_to(src.len());
        let record = record_text(&frame);
        Ok((!record.is_empty()).then_some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<String> {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(data);
        let mut out = Vec::new();
        while let Some(record) = codec.decode_eof(&mut buf).unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_encode_command_newline() {
        assert_eq!(encode_command(Framing::Newline, "PING"), b"nPING\n".to_vec());
    }

    #[test]
    fn test_encode_command_null() {
        assert_eq!(
            encode_command(Framing::Null, "SCAN /tmp/a b"),
            b"zSCAN /tmp/a b\0".to_vec()
        );
    }

    #[test]
    fn test_encode_chunk_big_endian_prefix() {
        let mut buf = BytesMut::new();
        encode_chunk(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn test_encode_terminator_chunk() {
        let mut buf = BytesMut::new();
        encode_chunk(&[], &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_write_chunk() {
        let mut output = Vec::new();
        write_chunk(&mut output, &[0xAB; 300]).await.unwrap();
        assert_eq!(&output[..4], &[0, 0, 1, 44]);
        assert_eq!(output.len(), 304);
    }

    #[test]
    fn test_decode_newline_records() {
        assert_eq!(
            decode_all(b"/a: OK\n/b: Eicar FOUND\n"),
            vec!["/a: OK", "/b: Eicar FOUND"]
        );
    }

    #[test]
    fn test_decode_null_records() {
        assert_eq!(decode_all(b"PONG\0"), vec!["PONG"]);
    }

    #[test]
    fn test_decode_skips_blank_lines_and_carriage_returns() {
        assert_eq!(
            decode_all(b"POOLS: 1\r\n\nSTATE: VALID PRIMARY\n"),
            vec!["POOLS: 1", "STATE: VALID PRIMARY"]
        );
    }

    #[test]
    fn test_decode_keeps_surrounding_spaces() {
        assert_eq!(decode_all(b" padded \n"), vec![" padded "]);
    }

    #[test]
    fn test_decode_partial_record_waits() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"stream: O"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"K\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("stream: OK"));
    }

    #[test]
    fn test_decode_unterminated_tail_at_eof() {
        assert_eq!(decode_all(b"RELOADING"), vec!["RELOADING"]);
    }

    #[test]
    fn test_decode_rejects_oversized_record() {
        let mut codec = ResponseCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
