//! Configuration file handling

use serde::Deserialize;
use std::path::Path;

use super::paths::config_path;
use super::{Error, Result};

/// Largest INSTREAM chunk we are willing to send in one frame
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Daemon connection settings
    #[serde(default)]
    pub clamd: ClamdConfig,
}

/// How commands are delimited on the wire
///
/// clamd accepts `nCOMMAND\n` (replies terminated by newlines) and
/// `zCOMMAND\0` (replies terminated by NUL bytes).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Newline,
    Null,
}

impl Framing {
    /// Prefix byte written before the command token
    pub fn prefix(self) -> u8 {
        match self {
            Framing::Newline => b'n',
            Framing::Null => b'z',
        }
    }

    /// Byte written after the command token
    pub fn delimiter(self) -> u8 {
        match self {
            Framing::Newline => b'\n',
            Framing::Null => b'\0',
        }
    }
}

/// Connection settings for one clamd daemon
#[derive(Debug, Clone, Deserialize)]
pub struct ClamdConfig {
    /// `tcp://host:port`, `unix:///path`, or a bare socket path
    #[serde(default = "default_address")]
    pub address: String,

    /// Command framing
    #[serde(default)]
    pub framing: Framing,

    /// INSTREAM chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Timeout for establishing the socket
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            framing: Framing::default(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ClamdConfig {
    /// Config pointing at the given address with default settings
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Reject settings the client cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_address() -> String {
    "tcp://127.0.0.1:3310".to_string()
}

fn default_chunk_size() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate TOML configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.clamd.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.clamd.address, "tcp://127.0.0.1:3310");
        assert_eq!(config.clamd.framing, Framing::Newline);
        assert_eq!(config.clamd.chunk_size, 1024);
        assert_eq!(config.clamd.connect_timeout_secs, 10);
    }

    #[test]
    fn test_parse_clamd_section() {
        let config = Config::parse(
            r#"
            [clamd]
            address = "unix:///run/clamav/clamd.ctl"
            framing = "null"
            chunk_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.clamd.address, "unix:///run/clamav/clamd.ctl");
        assert_eq!(config.clamd.framing, Framing::Null);
        assert_eq!(config.clamd.chunk_size, 4096);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = Config::parse("[clamd]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = Config::parse("[clamd\naddress = 1").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_framing_bytes() {
        assert_eq!(Framing::Newline.prefix(), b'n');
        assert_eq!(Framing::Newline.delimiter(), b'\n');
        assert_eq!(Framing::Null.prefix(), b'z');
        assert_eq!(Framing::Null.delimiter(), 0);
    }
}
