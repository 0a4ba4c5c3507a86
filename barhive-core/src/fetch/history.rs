//! Backfill orchestrator.
//!
//! Walks the requested month range, skipping units the checkpoint store has
//! already marked completed, and fetches the rest from a [`BulkSource`]. A
//! month whose archive is missing falls back to its daily archives. A unit is
//! checkpointed only after its bars are durably on disk, so an interrupted run
//! resumes without gaps or double fetches. Cancellation is cooperative and
//! checked at unit boundaries only; a unit in flight always finishes.

use super::progress::{FetchProgress, FetchReport};
use super::source::{BulkChunk, BulkSource, FetchError};
use crate::checkpoint::{month_range, CheckpointStore};
use crate::domain::{Bar, Instrument, Timeframe};
use crate::shutdown::StopSignal;
use crate::store::PartitionedStore;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One backfill job: a closed time window for one series.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub struct HistoryFetcher {
    store: PartitionedStore,
    checkpoints: Arc<CheckpointStore>,
    source: Arc<dyn BulkSource>,
    request_delay: Duration,
    stop: StopSignal,
}

impl HistoryFetcher {
    pub fn new(
        store: PartitionedStore,
        checkpoints: Arc<CheckpointStore>,
        source: Arc<dyn BulkSource>,
        request_delay: Duration,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            checkpoints,
            source,
            request_delay,
            stop,
        }
    }

    /// Run one backfill job to completion (or until stopped). Individual unit
    /// failures are recorded and skipped; only infrastructure errors (storage,
    /// checkpoint db) abort the run.
    pub async fn backfill(
        &self,
        request: &BackfillRequest,
        progress: &dyn FetchProgress,
    ) -> Result<FetchReport, FetchError> {
        let started = Instant::now();
        let exchange = request.instrument.exchange.clone();
        let symbol = request.instrument.pair_code();

        let from = (request.start.year(), request.start.month());
        let to = (request.end.year(), request.end.month());
        let all_months = month_range(from, to);

        self.heal_stale_checkpoints(request, &exchange, &symbol, &all_months)?;

        let pending =
            self.checkpoints
                .pending_periods(&exchange, &symbol, request.timeframe, from, to)?;

        let total = all_months.len();
        let mut report = FetchReport {
            skipped: total - pending.len(),
            ..Default::default()
        };
        info!(
            series = %request.instrument.canonical(),
            timeframe = %request.timeframe,
            total,
            pending = pending.len(),
            "starting backfill"
        );

        let mut done = report.skipped;
        for (index, &(year, month)) in pending.iter().enumerate() {
            if self.stop.is_stopped() {
                info!(
                    series = %request.instrument.canonical(),
                    remaining = pending.len() - index,
                    "backfill stopped"
                );
                break;
            }

            match self.run_unit(request, &exchange, &symbol, year, month).await {
                Ok((rows, dropped)) => {
                    report.completed += 1;
                    report.rows_written += rows;
                    report.rows_dropped += dropped;
                }
                Err(e @ (FetchError::Store(_) | FetchError::Checkpoint(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        series = %request.instrument.canonical(),
                        year,
                        month,
                        error = %e,
                        "backfill unit failed"
                    );
                    self.checkpoints.mark_failed(
                        &exchange,
                        &symbol,
                        request.timeframe,
                        year,
                        month,
                        None,
                        &e.to_string(),
                    )?;
                    report.failed += 1;
                }
            }

            done += 1;
            report.elapsed = started.elapsed();
            progress.on_unit(done, total, &report);

            if index + 1 < pending.len() && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
        }

        report.elapsed = started.elapsed();
        info!(
            series = %request.instrument.canonical(),
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            rows = report.rows_written,
            "backfill finished"
        );
        Ok(report)
    }

    /// A month checkpointed as completed whose partition file is gone (wiped
    /// cache, quarantined file) is returned to pending so it gets re-fetched.
    fn heal_stale_checkpoints(
        &self,
        request: &BackfillRequest,
        exchange: &str,
        symbol: &str,
        months: &[(i32, u32)],
    ) -> Result<(), FetchError> {
        for &(year, month) in months {
            let completed =
                self.checkpoints
                    .is_completed(exchange, symbol, request.timeframe, year, month, None)?;
            if completed
                && !self
                    .store
                    .partition_exists(&request.instrument, request.timeframe, year, month)
            {
                warn!(
                    series = %request.instrument.canonical(),
                    year,
                    month,
                    "checkpoint marked completed but partition missing, re-queueing"
                );
                self.checkpoints
                    .mark_pending(exchange, symbol, request.timeframe, year, month, None)?;
            }
        }
        Ok(())
    }

    /// Fetch, persist and checkpoint one month. Returns net new rows written
    /// and rows dropped by the sanity filter.
    async fn run_unit(
        &self,
        request: &BackfillRequest,
        exchange: &str,
        symbol: &str,
        year: i32,
        month: u32,
    ) -> Result<(usize, usize), FetchError> {
        let chunk = match self
            .source
            .fetch_month(&request.instrument, request.timeframe, year, month)
            .await
        {
            Ok(chunk) => chunk,
            Err(FetchError::NotFound { .. }) => {
                info!(
                    series = %request.instrument.canonical(),
                    year,
                    month,
                    "monthly archive missing, trying daily archives"
                );
                self.fetch_month_from_days(request, exchange, symbol, year, month)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let (bars, dropped) = clamp_bars(chunk.bars, request.start, request.end);
        if dropped > 0 {
            warn!(
                series = %request.instrument.canonical(),
                year,
                month,
                dropped,
                "dropped rows failing sanity checks"
            );
        }
        let written = self.persist(request, &bars).await?;

        self.checkpoints.mark_completed(
            exchange,
            symbol,
            request.timeframe,
            year,
            month,
            None,
            bars.len() as u64,
            chunk.checksum.as_deref(),
        )?;
        if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
            self.checkpoints.update_metadata(
                exchange,
                symbol,
                request.timeframe,
                first.time,
                last.time,
                written as u64,
            )?;
        }
        Ok((written, dropped))
    }

    /// Stitch a month together from daily archives. Missing days are normal
    /// near listing dates and the current month; a month with no days at all
    /// is treated as not found. The month is the cancellation unit: a stop
    /// arriving mid-month lets every remaining day finish, otherwise a
    /// partial day set would be checkpointed as a completed month.
    async fn fetch_month_from_days(
        &self,
        request: &BackfillRequest,
        exchange: &str,
        symbol: &str,
        year: i32,
        month: u32,
    ) -> Result<BulkChunk, FetchError> {
        let mut bars = Vec::new();
        let mut found_any = false;

        for date in days_of_month(year, month) {
            match self
                .source
                .fetch_day(&request.instrument, request.timeframe, date)
                .await
            {
                Ok(chunk) => {
                    found_any = true;
                    self.checkpoints.mark_completed(
                        exchange,
                        symbol,
                        request.timeframe,
                        year,
                        month,
                        Some(date.day()),
                        chunk.bars.len() as u64,
                        chunk.checksum.as_deref(),
                    )?;
                    bars.extend(chunk.bars);
                }
                Err(FetchError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
        }

        if !found_any {
            return Err(FetchError::NotFound {
                unit: format!("{symbol} {} {year:04}-{month:02}", request.timeframe),
            });
        }
        bars.sort_by_key(|b| b.time);
        Ok(BulkChunk {
            bars,
            checksum: None,
        })
    }

    /// Write bars off the async path. Parquet encode and compaction merge are
    /// blocking work.
    async fn persist(
        &self,
        request: &BackfillRequest,
        bars: &[Bar],
    ) -> Result<usize, FetchError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let store = self.store.clone();
        let instrument = request.instrument.clone();
        let timeframe = request.timeframe;
        let bars = bars.to_vec();
        tokio::task::spawn_blocking(move || store.write(&instrument, timeframe, &bars, true))
            .await
            .map_err(|e| FetchError::Task(format!("storage task: {e}")))?
            .map_err(FetchError::from)
    }
}

/// Restrict archive bars to the requested window and drop rows with
/// non-finite or inconsistent prices. Returns the kept bars and the count
/// dropped for failing the sanity check (window trimming is not counted).
fn clamp_bars(bars: Vec<Bar>, start: DateTime<Utc>, end: DateTime<Utc>) -> (Vec<Bar>, usize) {
    let mut dropped = 0;
    let kept = bars
        .into_iter()
        .filter(|b| {
            if b.time < start || b.time > end {
                return false;
            }
            if !b.is_sane() {
                dropped += 1;
                return false;
            }
            true
        })
        .collect();
    (kept, dropped)
}

fn days_of_month(year: i32, month: u32) -> impl Iterator<Item = NaiveDate> {
    (1..=31).filter_map(move |day| NaiveDate::from_ymd_opt(year, month, day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn days_of_month_handles_short_months() {
        assert_eq!(days_of_month(2024, 2).count(), 29);
        assert_eq!(days_of_month(2023, 2).count(), 28);
        assert_eq!(days_of_month(2024, 1).count(), 31);
    }

    #[test]
    fn clamp_drops_out_of_window_and_insane_bars() {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        let bar = |time| Bar {
            time,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 1.0,
        };
        let mut broken = bar(t(2));
        broken.low = 20.0; // low above high

        let bars = vec![bar(t(0)), bar(t(1)), broken, bar(t(5))];
        let (kept, dropped) = clamp_bars(bars, t(1), t(3));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].time, t(1));
        assert_eq!(dropped, 1); // only the insane bar counts, not window trims
    }
}
