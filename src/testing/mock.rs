//! Scripted clamd stand-in
//!
//! Speaks enough of the daemon protocol to drive the client end to end:
//! `n`/`z` framed commands, INSTREAM chunk decoding with a size limit, and
//! canned or scripted replies. Everything it receives is recorded.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::common::config::ClamdConfig;

/// Payload marker that makes the mock report a detection
pub const EICAR_MARKER: &[u8] = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

/// Upload size above which INSTREAM is refused, like clamd's StreamMaxLength
pub const DEFAULT_STREAM_MAX_LENGTH: usize = 25 * 1024 * 1024;

pub const MOCK_VERSION: &str = "ClamAV 1.3.1/27400/Mon Oct 19 08:00:00 2026";

/// What the mock sends back for a command
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send the records, then close
    Records(Vec<String>),
    /// Send the records, then wait for the client to hang up
    RecordsKeepOpen(Vec<String>),
    /// Close without replying
    Close,
}

impl Reply {
    pub fn records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Reply::Records(records.into_iter().map(Into::into).collect())
    }
}

/// One exchange as seen by the mock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// Command line without framing
    pub command: String,
    /// Framing prefix byte, `None` for unprefixed commands
    pub prefix: Option<u8>,
    /// Sizes of the INSTREAM data chunks in arrival order
    pub chunk_sizes: Vec<usize>,
    pub payload: Vec<u8>,
    /// Whether the zero-length chunk arrived
    pub terminated: bool,
}

#[derive(Debug)]
struct MockState {
    script: Mutex<HashMap<String, Reply>>,
    received: Mutex<Vec<Received>>,
    stream_max_length: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process mock daemon listening on TCP or a Unix socket
pub struct MockClamd {
    address: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockClamd {
    fn state() -> Arc<MockState> {
        Arc::new(MockState {
            script: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            stream_max_length: DEFAULT_STREAM_MAX_LENGTH,
        })
    }

    /// Listen on an ephemeral localhost TCP port
    pub async fn start_tcp() -> io::Result<Self> {
        Self::start_tcp_on("127.0.0.1:0").await
    }

    /// Listen on a specific TCP address
    pub async fn start_tcp_on(bind: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let address = format!("tcp://{}", listener.local_addr()?);
        let state = Self::state();

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::trace!(%peer, "Mock clamd accepted TCP client");
                        tokio::spawn(serve(stream, Arc::clone(&accept_state)));
                    }
                    Err(e) => {
                        tracing::error!("Mock clamd accept error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            address,
            state,
            task,
        })
    }

    /// Listen on a Unix socket at `path`
    #[cfg(unix)]
    pub async fn start_unix(path: &std::path::Path) -> io::Result<Self> {
        use interprocess::local_socket::tokio::prelude::*;
        use interprocess::local_socket::{GenericFilePath, ListenerOptions};

        let name = path.to_fs_name::<GenericFilePath>()?;
        let listener = ListenerOptions::new().name(name).create_tokio()?;
        let address = format!("unix://{}", path.display());
        let state = Self::state();

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        tracing::trace!("Mock clamd accepted Unix client");
                        tokio::spawn(serve(stream, Arc::clone(&accept_state)));
                    }
                    Err(e) => {
                        tracing::error!("Mock clamd accept error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            address,
            state,
            task,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Client configuration pointing at this mock
    pub fn config(&self) -> ClamdConfig {
        ClamdConfig::with_address(self.address.clone())
    }

    /// Override the reply for a command name (first token, e.g. `MULTISCAN`)
    pub fn set_reply(&self, command: &str, reply: Reply) {
        lock(&self.state.script).insert(command.to_string(), reply);
    }

    /// Everything received so far, in arrival order
    pub fn received(&self) -> Vec<Received> {
        lock(&self.state.received).clone()
    }

    /// Wait until `count` exchanges were recorded
    pub async fn wait_for_exchanges(&self, count: usize) -> Vec<Received> {
        loop {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockClamd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(stream: S, state: Arc<MockState>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = handle(stream, &state).await {
        tracing::debug!("Mock clamd client error: {}", e);
    }
}

async fn handle<S>(stream: S, state: &MockState) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        return Ok(());
    }
    let (prefix, delimiter) = match first[0] {
        b'n' => (Some(b'n'), b'\n'),
        b'z' => (Some(b'z'), b'\0'),
        _ => (None, b'\n'),
    };

    let mut line = Vec::new();
    if prefix.is_none() {
        line.push(first[0]);
    }
    stream.read_until(delimiter, &mut line).await?;
    if line.last() == Some(&delimiter) {
        line.pop();
    }
    let command = String::from_utf8_lossy(&line).into_owned();
    tracing::trace!(command = %command, "Mock clamd received command");

    let mut received = Received {
        command: command.clone(),
        prefix,
        ..Received::default()
    };

    let name = command.split(' ').next().unwrap_or_default().to_string();
    let scripted = lock(&state.script).get(&name).cloned();

    let mut rest_of_upload = None;
    let reply = if name == "INSTREAM" {
        let outcome = read_instream(&mut stream, &mut received, state.stream_max_length).await;
        lock(&state.received).push(received.clone());
        match outcome? {
            InstreamOutcome::Truncated => return Ok(()),
            InstreamOutcome::TooLarge { pending } => {
                rest_of_upload = Some(pending);
                Reply::records(["INSTREAM size limit exceeded. ERROR"])
            }
            InstreamOutcome::Complete => scripted.unwrap_or_else(|| instream_verdict(&received)),
        }
    } else {
        lock(&state.received).push(received);
        scripted.unwrap_or_else(|| default_reply(&name, &command))
    };

    let writer = stream.get_mut();
    let (records, keep_open) = match reply {
        Reply::Records(records) => (records, false),
        Reply::RecordsKeepOpen(records) => (records, true),
        Reply::Close => return Ok(()),
    };
    for record in records {
        writer.write_all(record.as_bytes()).await?;
        writer.write_all(&[delimiter]).await?;
    }
    writer.flush().await?;

    // The refusal goes out mid-upload; swallow the rest so closing with
    // unread input does not reset the connection under the reply.
    if let Some(pending) = rest_of_upload {
        skip_instream(&mut stream, pending).await?;
    }

    if keep_open {
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).await?;
    }
    Ok(())
}

enum InstreamOutcome {
    Complete,
    /// Limit exceeded; `pending` bytes of the current chunk are still unread
    TooLarge { pending: u64 },
    /// Client hung up before the terminator
    Truncated,
}

async fn read_instream<R>(
    reader: &mut R,
    received: &mut Received,
    max_length: usize,
) -> io::Result<InstreamOutcome>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(InstreamOutcome::Truncated),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            received.terminated = true;
            return Ok(InstreamOutcome::Complete);
        }
        if received.payload.len() + len > max_length {
            return Ok(InstreamOutcome::TooLarge {
                pending: len as u64,
            });
        }

        let start = received.payload.len();
        received.payload.resize(start + len, 0);
        match reader.read_exact(&mut received.payload[start..]).await {
            Ok(_) => received.chunk_sizes.push(len),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                received.payload.truncate(start);
                return Ok(InstreamOutcome::Truncated);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Discard INSTREAM data up to and including the terminator
async fn skip_instream<R>(reader: &mut R, mut pending: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::io::copy(&mut (&mut *reader).take(pending), &mut tokio::io::sink()).await?;
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        pending = u64::from(u32::from_be_bytes(len_buf));
        if pending == 0 {
            return Ok(());
        }
    }
}

fn instream_verdict(received: &Received) -> Reply {
    let infected = received
        .payload
        .windows(EICAR_MARKER.len())
        .any(|w| w == EICAR_MARKER);
    if infected {
        Reply::records(["stream: Eicar-Test-Signature FOUND"])
    } else {
        Reply::records(["stream: OK"])
    }
}

fn default_reply(name: &str, command: &str) -> Reply {
    match name {
        "PING" => Reply::records(["PONG"]),
        "VERSION" => Reply::records([MOCK_VERSION]),
        "RELOAD" => Reply::records(["RELOADING"]),
        "SHUTDOWN" => Reply::Close,
        "STATS" => Reply::records([
            "POOLS: 1",
            "",
            "STATE: VALID PRIMARY",
            "THREADS: live 1  idle 0 max 12 idle-timeout 30",
            "QUEUE: 0 items",
            "MEMSTATS: heap N/A mmap N/A used N/A free N/A releasable N/A pools 1 pools_used 1306.837M pools_total 1306.882M",
            "END",
        ]),
        "SCAN" | "RAWSCAN" | "MULTISCAN" | "CONTSCAN" | "ALLMATCHSCAN" => {
            let path = command.split_once(' ').map(|(_, p)| p).unwrap_or_default();
            Reply::records([format!("{}: OK", path)])
        }
        _ => Reply::records([format!("{}: Unknown command. ERROR", command)]),
    }
}
