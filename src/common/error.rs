//! Error types for the clamd client
//!
//! Protocol failures are kept distinct from daemon-reported scan errors:
//! a file the daemon could not scan comes back as a `ScanResult` with
//! status `ERROR`, never as an `Error`.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the clamd client
#[derive(Error, Debug)]
pub enum Error {
    // === Transport Errors ===
    #[error("Invalid clamd address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("Failed to connect to clamd at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    // === Protocol I/O Errors ===
    #[error("Failed to write to clamd: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to read from clamd: {0}")]
    Read(#[source] io::Error),

    #[error("Unexpected clamd response to {command}: {response}")]
    Protocol { command: String, response: String },

    #[error("Failed to read upload source: {0}")]
    Source(#[source] io::Error),

    #[error("Stream upload cancelled")]
    Cancelled,

    #[error("Scan path contains a command delimiter: {0:?}")]
    InvalidPath(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an address error
    pub fn address(address: &str, reason: impl Into<String>) -> Self {
        Self::Address {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a connect error
    pub fn connect(address: &str, source: io::Error) -> Self {
        Self::Connect {
            address: address.to_string(),
            source,
        }
    }

    /// Create a protocol error for a scalar command
    pub fn protocol(command: &str, response: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.to_string(),
            response: response.into(),
        }
    }
}
