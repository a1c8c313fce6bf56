//! Common utilities shared between the library and the binaries

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
