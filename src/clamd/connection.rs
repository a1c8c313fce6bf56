//! A single clamd exchange over one socket
//!
//! The socket is split: the write half stays here for commands and chunks,
//! the read half is handed to a drain task by `read_response`. The socket is
//! released once both halves are gone, so `close` never cuts off a reply
//! that is still being drained.

use std::io;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

use super::codec;
use super::response::{self, DrainComplete, ScanResults};
use super::transport::{self, Address, BoxedStream};
use crate::common::config::{ClamdConfig, Framing};
use crate::common::{Error, Result};

/// Connection to clamd for the duration of one command
pub struct Connection {
    address: String,
    framing: Framing,
    reader: Option<ReadHalf<BoxedStream>>,
    writer: Option<WriteHalf<BoxedStream>>,
}

impl Connection {
    /// Resolve the configured address and open a socket
    pub async fn open(config: &ClamdConfig) -> Result<Self> {
        let address = Address::parse(&config.address)?;
        let timeout = std::time::Duration::from_secs(config.connect_timeout_secs);
        let stream = transport::connect(&address, timeout)
            .await
            .map_err(|e| Error::connect(&config.address, e))?;
        tracing::debug!(address = %address, "Connected to clamd");
        Ok(Self::from_stream(stream, address.to_string(), config.framing))
    }

    /// Wrap an already established stream
    pub fn from_stream(stream: BoxedStream, address: impl Into<String>, framing: Framing) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            address: address.into(),
            framing,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn writer(&mut self) -> Result<&mut WriteHalf<BoxedStream>> {
        self.writer.as_mut().ok_or_else(|| {
            Error::Write(io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
        })
    }

    /// Send a command token
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        tracing::debug!(address = %self.address, command, "Sending clamd command");
        let framing = self.framing;
        let writer = self.writer()?;
        codec::write_command(writer, framing, command)
            .await
            .map_err(Error::Write)
    }

    /// Send one INSTREAM chunk
    ///
    /// An empty chunk terminates the stream; use [`Connection::send_eof`]
    /// for that so it is sent exactly once.
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        tracing::trace!(bytes = data.len(), "Sending INSTREAM chunk");
        let writer = self.writer()?;
        codec::write_chunk(writer, data).await.map_err(Error::Write)
    }

    /// Send the zero-length chunk that ends an INSTREAM upload
    pub async fn send_eof(&mut self) -> Result<()> {
        self.send_chunk(&[]).await
    }

    /// Start draining the reply on a background task
    ///
    /// `terminator` names a record after which the daemon has nothing more
    /// to say even if it keeps the socket open. Can only be called once.
    pub fn read_response(
        &mut self,
        terminator: Option<&'static str>,
    ) -> Result<(ScanResults, DrainComplete)> {
        let reader = self.reader.take().ok_or_else(|| {
            Error::Read(io::Error::new(
                io::ErrorKind::NotConnected,
                "response already taken or connection closed",
            ))
        })?;
        Ok(response::spawn_drain(reader, terminator))
    }

    /// Close our side of the socket; calling it again is a no-op
    pub async fn close(&mut self) {
        self.reader.take();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(error = %e, "Shutdown of clamd socket failed");
            }
            tracing::debug!(address = %self.address, "Closed clamd connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Close once the drain task has finished, without blocking the caller
    pub fn close_after(mut self, done: DrainComplete) {
        tokio::spawn(async move {
            // A dropped sender also means the drain task is gone.
            let _ = done.await;
            self.close().await;
        });
    }
}
