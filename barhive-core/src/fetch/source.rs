//! Bulk archive source abstraction and the fetch error taxonomy.

use crate::checkpoint::CheckpointError;
use crate::domain::{Bar, Instrument, Timeframe};
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

/// One decoded archive: bars plus the checksum recorded alongside it (if the
/// remote published one).
#[derive(Debug, Clone)]
pub struct BulkChunk {
    pub bars: Vec<Bar>,
    pub checksum: Option<String>,
}

/// Errors from the historical ingestion path.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote has no archive for this unit. Triggers the daily fallback
    /// at month level; not an error in itself.
    #[error("archive not found: {unit}")]
    NotFound { unit: String },

    /// Transient transport failure, surfaced after retries are exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// Archive or row decoding failed; the unit fails with no partial write.
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A background task panicked or was aborted mid-unit.
    #[error("task failure: {0}")]
    Task(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Remote bulk-data source publishing monthly archives with a per-day
/// fallback. Implemented over HTTP in production and mocked in tests.
#[async_trait]
pub trait BulkSource: Send + Sync {
    async fn fetch_month(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        year: i32,
        month: u32,
    ) -> Result<BulkChunk, FetchError>;

    async fn fetch_day(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        date: NaiveDate,
    ) -> Result<BulkChunk, FetchError>;
}

/// Normalize a raw archive timestamp to milliseconds, auto-detecting the unit
/// (seconds / milliseconds / microseconds) from its magnitude.
pub fn normalize_ts_ms(raw: i64) -> i64 {
    if raw < 100_000_000_000 {
        raw * 1_000 // seconds
    } else if raw < 100_000_000_000_000 {
        raw // already milliseconds
    } else {
        raw / 1_000 // microseconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_seconds_millis_and_micros() {
        // 2024-01-01T00:00:00Z in each unit.
        let ms = 1_704_067_200_000i64;
        assert_eq!(normalize_ts_ms(ms / 1_000), ms);
        assert_eq!(normalize_ts_ms(ms), ms);
        assert_eq!(normalize_ts_ms(ms * 1_000), ms);
    }
}
