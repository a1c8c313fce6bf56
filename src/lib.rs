//! clamd client - async client for the ClamAV daemon protocol
//!
//! This library speaks the clamd command protocol over TCP or Unix domain
//! sockets, including chunked INSTREAM uploads, and streams decoded reply
//! records back to the caller as they arrive.

pub mod clamd;
pub mod cli;
pub mod commands;
pub mod common;
pub mod testing;

// Re-export commonly used types
pub use clamd::{Clamd, ScanMode, ScanReport, ScanResult, ScanResults, ScanStatus, Stats};
pub use common::config::{ClamdConfig, Framing};
pub use common::{Error, Result};
pub use tokio_util::sync::CancellationToken;
