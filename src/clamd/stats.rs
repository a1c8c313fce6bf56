//! Aggregation of the STATS reply
//!
//! clamd documents the STATS format as subject to change, so unknown
//! sections are skipped instead of treated as errors.

use serde::Serialize;

use super::response::{ScanResult, ScanResults};
use crate::common::Result;

/// Record that ends a STATS reply
pub const STATS_TERMINATOR: &str = "END";

/// Snapshot of the daemon's scan queue, threads and memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub pools: String,
    pub state: String,
    pub threads: String,
    pub memstats: String,
    pub queue: String,
}

impl Stats {
    /// Fold one STATS record into the snapshot
    pub fn apply(&mut self, record: &ScanResult) {
        let raw = record.raw.as_str();
        if let Some(rest) = raw.strip_prefix("POOLS") {
            self.pools = rest.trim_start_matches(':').trim_matches(' ').to_string();
        } else if raw.starts_with("STATE") {
            self.state = raw.to_string();
        } else if raw.starts_with("THREADS") {
            self.threads = raw.to_string();
        } else if raw.starts_with("QUEUE") {
            self.queue = raw.to_string();
        } else if raw.starts_with("MEMSTATS") {
            self.memstats = raw.to_string();
        } else if raw.starts_with(STATS_TERMINATOR) {
            // carries no data
        } else {
            tracing::trace!(record = raw, "Ignoring unknown STATS record");
        }
    }

    /// Consume a STATS reply into a snapshot
    pub async fn collect(mut records: ScanResults) -> Result<Self> {
        let mut stats = Stats::default();
        while let Some(record) = records.next().await {
            stats.apply(&record?);
        }
        Ok(stats)
    }
}
