//! Metrics for TupleKV
//!
//! Thin wrappers over the `metrics` facade. The library never installs a
//! recorder; embedding applications choose their exporter.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

use metrics::{counter, histogram};
use std::time::Instant;

// ============================================================================
// Operation Metrics
// ============================================================================

/// Record a store operation
pub fn record_operation(op: &'static str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("tuplekv_operations_total", "op" => op, "status" => status).increment(1);
}

/// Record store operation latency
pub fn record_operation_latency(op: &'static str, latency_us: f64) {
    histogram!("tuplekv_operation_duration_us", "op" => op).record(latency_us);
}

/// Record rows returned by a scan or batch read
pub fn record_rows_scanned(count: u64) {
    counter!("tuplekv_rows_scanned_total").increment(count);
}

// ============================================================================
// Transaction Metrics
// ============================================================================

/// How a transaction frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Commit,
    Rollback,
    /// The engine refused BEGIN/SAVEPOINT and the body ran unprotected
    Degraded,
}

impl TxnOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnOutcome::Commit => "commit",
            TxnOutcome::Rollback => "rollback",
            TxnOutcome::Degraded => "degraded",
        }
    }
}

/// Record a finished transaction frame
pub fn record_transaction(outcome: TxnOutcome, nested: bool) {
    let level = if nested { "savepoint" } else { "top" };
    counter!("tuplekv_transactions_total", "outcome" => outcome.as_str(), "level" => level)
        .increment(1);
}

// ============================================================================
// Timers
// ============================================================================

/// Timer guard for automatic latency recording
pub struct LatencyTimer {
    start: Instant,
    op: &'static str,
}

impl LatencyTimer {
    pub fn new(op: &'static str) -> Self {
        Self {
            start: Instant::now(),
            op,
        }
    }

    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000_000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_operation_latency(self.op, self.elapsed_us());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(TxnOutcome::Commit.as_str(), "commit");
        assert_eq!(TxnOutcome::Rollback.as_str(), "rollback");
        assert_eq!(TxnOutcome::Degraded.as_str(), "degraded");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_operation("get", true);
        record_rows_scanned(3);
        record_transaction(TxnOutcome::Commit, false);
        let timer = LatencyTimer::new("set");
        assert!(timer.elapsed_us() >= 0.0);
    }
}
