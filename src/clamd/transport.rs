//! Address resolution and socket setup
//!
//! clamd listens on TCP and/or a Unix domain socket. TCP goes through
//! tokio directly; Unix sockets use the interprocess crate.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::common::{Error, Result};

pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Stream};
    pub use interprocess::local_socket::GenericFilePath;
}

use platform::*;

/// Any bidirectional byte stream a clamd exchange can run over
pub trait DaemonStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DaemonStream for T {}

/// Type-erased socket, either TCP or Unix domain
pub type BoxedStream = Box<dyn DaemonStream>;

/// Parsed connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Address {
    /// Parse a configured daemon address
    ///
    /// `tcp://host:port` dials TCP and `unix:///path` connects to a Unix
    /// socket. Anything without one of those two schemes is taken verbatim
    /// as a Unix socket path.
    pub fn parse(address: &str) -> Result<Self> {
        if address.trim().is_empty() {
            return Err(Error::address(address, "address is empty"));
        }

        if let Some(rest) = address.strip_prefix("tcp://") {
            let authority = rest.strip_suffix('/').unwrap_or(rest);
            let (host, port) = split_host_port(authority)
                .ok_or_else(|| Error::address(address, "expected tcp://host:port"))?;
            if host.is_empty() {
                return Err(Error::address(address, "missing host"));
            }
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::address(address, format!("invalid port '{}'", port)))?;
            return Ok(Address::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if let Some(rest) = address.strip_prefix("unix://") {
            // Any authority before the path is ignored, as with file URLs.
            let path = rest.find('/').map(|idx| &rest[idx..]).unwrap_or("");
            if path.is_empty() {
                return Err(Error::address(address, "missing socket path"));
            }
            return Ok(Address::Unix {
                path: PathBuf::from(path),
            });
        }

        Ok(Address::Unix {
            path: PathBuf::from(address),
        })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Address::Tcp { .. })
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Address::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Address::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Split `host:port` or `[v6]:port`, stripping IPv6 brackets
fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 literal
        return None;
    }
    Some((host, port))
}

/// Open a socket to the daemon
pub async fn connect(address: &Address, timeout: Duration) -> io::Result<BoxedStream> {
    let stream = tokio::time::timeout(timeout, open(address))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {}s", timeout.as_secs()),
            )
        })??;
    Ok(stream)
}

async fn open(address: &Address) -> io::Result<BoxedStream> {
    match address {
        Address::Tcp { host, port } => {
            tracing::debug!(host = %host, port, "Dialing clamd over TCP");
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Address::Unix { path } => {
            tracing::debug!(path = %path.display(), "Connecting to clamd Unix socket");
            let name = path.as_path().to_fs_name::<GenericFilePath>()?;
            let stream = Stream::connect(name).await?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = Address::parse("tcp://127.0.0.1:3310").unwrap();
        assert_eq!(
            addr,
            Address::Tcp {
                host: "127.0.0.1".to_string(),
                port: 3310
            }
        );
        assert!(addr.is_tcp());
    }

    #[test]
    fn test_parse_tcp_hostname_and_trailing_slash() {
        let addr = Address::parse("tcp://clamav.internal:3310/").unwrap();
        assert_eq!(
            addr,
            Address::Tcp {
                host: "clamav.internal".to_string(),
                port: 3310
            }
        );
    }

    #[test]
    fn test_parse_tcp_ipv6() {
        let addr = Address::parse("tcp://[::1]:3310").unwrap();
        assert_eq!(
            addr,
            Address::Tcp {
                host: "::1".to_string(),
                port: 3310
            }
        );
        assert_eq!(addr.to_string(), "tcp://[::1]:3310");
    }

    #[test]
    fn test_parse_tcp_invalid() {
        for bad in ["tcp://", "tcp://host", "tcp://:3310", "tcp://host:abc", "tcp://host:0", "tcp://::1:3310"] {
            let err = Address::parse(bad).unwrap_err();
            assert!(matches!(err, Error::Address { .. }), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_parse_unix_scheme() {
        let addr = Address::parse("unix:///var/run/clamav/clamd.ctl").unwrap();
        assert_eq!(
            addr,
            Address::Unix {
                path: PathBuf::from("/var/run/clamav/clamd.ctl")
            }
        );
        assert!(!addr.is_tcp());
    }

    #[test]
    fn test_parse_unix_empty_path() {
        assert!(matches!(
            Address::parse("unix://").unwrap_err(),
            Error::Address { .. }
        ));
    }

    #[test]
    fn test_bare_path_is_unix() {
        let addr = Address::parse("/tmp/clamd.socket").unwrap();
        assert_eq!(
            addr,
            Address::Unix {
                path: PathBuf::from("/tmp/clamd.socket")
            }
        );
    }

    #[test]
    fn test_unknown_scheme_is_unix_path() {
        let addr = Address::parse("http://localhost:3310").unwrap();
        assert_eq!(
            addr,
            Address::Unix {
                path: PathBuf::from("http://localhost:3310")
            }
        );
    }

    #[test]
    fn test_empty_address() {
        assert!(matches!(Address::parse("  ").unwrap_err(), Error::Address { .. }));
    }

    #[tokio::test]
    async fn test_connect_missing_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::Unix {
            path: dir.path().join("missing.sock"),
        };
        assert!(connect(&addr, Duration::from_secs(1)).await.is_err());
    }
}
