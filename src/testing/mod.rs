//! Test support
//!
//! An in-process clamd stand-in used by the integration tests and the
//! `mock-clamd` binary, so the client can be exercised without a real
//! daemon or virus database.

mod mock;

pub use mock::*;
