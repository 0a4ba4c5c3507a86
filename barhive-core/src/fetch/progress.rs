//! Backfill progress reporting.

use std::time::Duration;
use tracing::info;

/// Rolling tally for one backfill run.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    /// Units fetched, written and checkpointed this run.
    pub completed: usize,
    /// Units already checkpointed before the run started.
    pub skipped: usize,
    /// Units that errored after exhausting retries.
    pub failed: usize,
    /// Net new rows persisted across all partitions.
    pub rows_written: usize,
    /// Rows discarded by the sanity filter (non-finite or inconsistent
    /// prices).
    pub rows_dropped: usize,
    /// Wall time since the run started.
    pub elapsed: Duration,
}

/// Callback invoked once per finished work unit. Implementations must not
/// block; heavy consumers should hand off to a channel.
pub trait FetchProgress: Send + Sync {
    fn on_unit(&self, done: usize, total: usize, report: &FetchReport);
}

/// Progress sink that emits one log line per unit.
#[derive(Debug, Default)]
pub struct LogProgress;

impl FetchProgress for LogProgress {
    fn on_unit(&self, done: usize, total: usize, report: &FetchReport) {
        info!(
            done,
            total,
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            rows = report.rows_written,
            dropped = report.rows_dropped,
            "backfill progress"
        );
    }
}

/// No-op sink for callers that only want the final report.
#[derive(Debug, Default)]
pub struct SilentProgress;

impl FetchProgress for SilentProgress {
    fn on_unit(&self, _done: usize, _total: usize, _report: &FetchReport) {}
}
