//! End-to-end backfill behavior against a mock archive source.

use async_trait::async_trait;
use barhive_core::checkpoint::CheckpointStore;
use barhive_core::domain::{Bar, Instrument, Timeframe};
use barhive_core::fetch::{
    BackfillRequest, BulkChunk, BulkSource, FetchError, HistoryFetcher, SilentProgress,
};
use barhive_core::store::PartitionedStore;
use barhive_core::StopSignal;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root() -> PathBuf {
    let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("barhive-backfill-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn instrument() -> Instrument {
    Instrument::new("BINANCE", "BTC", "USDT")
}

fn hourly_bars(year: i32, month: u32, hours: u32) -> Vec<Bar> {
    (0..hours)
        .map(|h| {
            let time = Utc
                .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .unwrap()
                + chrono::Duration::hours(h as i64);
            Bar {
                time,
                open: 100.0 + h as f64,
                high: 101.0 + h as f64,
                low: 99.0 + h as f64,
                close: 100.5 + h as f64,
                volume: 1.0,
            }
        })
        .collect()
}

#[derive(Default)]
struct MockSource {
    months: HashMap<(i32, u32), Vec<Bar>>,
    days: HashMap<NaiveDate, Vec<Bar>>,
    fail_months: HashSet<(i32, u32)>,
    month_calls: Mutex<Vec<(i32, u32)>>,
    /// Raised after the first successful day fetch, simulating a shutdown
    /// request arriving while a daily fallback is in flight.
    stop_after_first_day: Option<StopSignal>,
}

#[async_trait]
impl BulkSource for MockSource {
    async fn fetch_month(
        &self,
        _instrument: &Instrument,
        _timeframe: Timeframe,
        year: i32,
        month: u32,
    ) -> Result<BulkChunk, FetchError> {
        self.month_calls.lock().unwrap().push((year, month));
        if self.fail_months.contains(&(year, month)) {
            return Err(FetchError::Network("simulated outage".to_string()));
        }
        match self.months.get(&(year, month)) {
            Some(bars) => Ok(BulkChunk {
                bars: bars.clone(),
                checksum: Some("cafebabe".to_string()),
            }),
            None => Err(FetchError::NotFound {
                unit: format!("{year:04}-{month:02}"),
            }),
        }
    }

    async fn fetch_day(
        &self,
        _instrument: &Instrument,
        _timeframe: Timeframe,
        date: NaiveDate,
    ) -> Result<BulkChunk, FetchError> {
        match self.days.get(&date) {
            Some(bars) => {
                if let Some(stop) = &self.stop_after_first_day {
                    stop.stop();
                }
                Ok(BulkChunk {
                    bars: bars.clone(),
                    checksum: None,
                })
            }
            None => Err(FetchError::NotFound {
                unit: date.to_string(),
            }),
        }
    }
}

fn fetcher(
    store: &PartitionedStore,
    checkpoints: &Arc<CheckpointStore>,
    source: MockSource,
) -> (HistoryFetcher, Arc<MockSource>) {
    let source = Arc::new(source);
    let fetcher = HistoryFetcher::new(
        store.clone(),
        Arc::clone(checkpoints),
        source.clone(),
        Duration::ZERO,
        StopSignal::default(),
    );
    (fetcher, source)
}

fn request(start: DateTime<Utc>, end: DateTime<Utc>) -> BackfillRequest {
    BackfillRequest {
        instrument: instrument(),
        timeframe: Timeframe::H1,
        start,
        end,
    }
}

#[tokio::test]
async fn backfill_writes_and_checkpoints_each_month() -> anyhow::Result<()> {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory()?);

    let mut source = MockSource::default();
    source.months.insert((2024, 1), hourly_bars(2024, 1, 48));
    source.months.insert((2024, 2), hourly_bars(2024, 2, 48));
    let (fetcher, _) = fetcher(&store, &checkpoints, source);

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await?;

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.rows_written, 96);

    let bars = store.read(&instrument(), Timeframe::H1, None, None)?;
    assert_eq!(bars.len(), 96);
    assert!(checkpoints.is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, None)?);
    assert!(checkpoints.is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 2, None)?);

    let meta = checkpoints
        .get_metadata("BINANCE", "BTCUSDT", Timeframe::H1)?
        .expect("series metadata missing");
    assert_eq!(meta.rows_total, 96);
    assert_eq!(meta.earliest, req.start);
    Ok(())
}

#[tokio::test]
async fn second_run_skips_completed_months() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    let mut source = MockSource::default();
    source.months.insert((2024, 1), hourly_bars(2024, 1, 24));
    let (fetcher, source) = fetcher(&store, &checkpoints, source);

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    fetcher.backfill(&req, &SilentProgress).await.unwrap();
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(source.month_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_result() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    let jan = hourly_bars(2024, 1, 24);
    let feb = hourly_bars(2024, 2, 24);
    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap(),
    );

    // First run: February fails transiently.
    let mut broken = MockSource::default();
    broken.months.insert((2024, 1), jan.clone());
    broken.months.insert((2024, 2), feb.clone());
    broken.fail_months.insert((2024, 2));
    let (first, _) = fetcher(&store, &checkpoints, broken);
    let report = first.backfill(&req, &SilentProgress).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);

    // Second run: source healthy again. Only February is re-fetched.
    let mut healthy = MockSource::default();
    healthy.months.insert((2024, 1), jan.clone());
    healthy.months.insert((2024, 2), feb.clone());
    let (second, source) = fetcher(&store, &checkpoints, healthy);
    let report = second.backfill(&req, &SilentProgress).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(*source.month_calls.lock().unwrap(), vec![(2024, 2)]);

    let bars = store.read(&instrument(), Timeframe::H1, None, None).unwrap();
    assert_eq!(bars.len(), jan.len() + feb.len());
}

#[tokio::test]
async fn stale_checkpoint_with_missing_partition_is_refetched() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    // Checkpoint claims January is done but nothing is on disk.
    checkpoints
        .mark_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, None, 24, None)
        .unwrap();

    let mut source = MockSource::default();
    source.months.insert((2024, 1), hourly_bars(2024, 1, 24));
    let (fetcher, _) = fetcher(&store, &checkpoints, source);

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.skipped, 0);
    let bars = store.read(&instrument(), Timeframe::H1, None, None).unwrap();
    assert_eq!(bars.len(), 24);
}

#[tokio::test]
async fn missing_monthly_archive_falls_back_to_daily() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    // No monthly archive; days 1 and 2 exist, the rest of the month does not.
    let mut source = MockSource::default();
    let all = hourly_bars(2024, 1, 48);
    source.days.insert(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        all[..24].to_vec(),
    );
    source.days.insert(
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        all[24..].to_vec(),
    );
    let (fetcher, _) = fetcher(&store, &checkpoints, source);

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.rows_written, 48);
    assert!(checkpoints
        .is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, None)
        .unwrap());
    assert!(checkpoints
        .is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, Some(2))
        .unwrap());
}

#[tokio::test]
async fn stop_during_daily_fallback_still_completes_the_whole_month() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    // No monthly archive; two daily archives. The stop request fires while
    // day 1 is being fetched — the month must still be stitched in full, or
    // the completed checkpoint would hide the missing days forever.
    let stop = StopSignal::default();
    let all = hourly_bars(2024, 1, 48);
    let mut source = MockSource {
        stop_after_first_day: Some(stop.clone()),
        ..Default::default()
    };
    source.days.insert(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        all[..24].to_vec(),
    );
    source.days.insert(
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        all[24..].to_vec(),
    );
    let fetcher = HistoryFetcher::new(
        store.clone(),
        Arc::clone(&checkpoints),
        Arc::new(source),
        Duration::ZERO,
        stop.clone(),
    );

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert!(stop.is_stopped());
    assert_eq!(report.completed, 1);
    assert_eq!(report.rows_written, 48);
    let bars = store.read(&instrument(), Timeframe::H1, None, None).unwrap();
    assert_eq!(bars.len(), 48);
    assert!(checkpoints
        .is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, None)
        .unwrap());
}

#[tokio::test]
async fn month_with_no_archives_at_all_fails_the_unit() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());
    let (fetcher, _) = fetcher(&store, &checkpoints, MockSource::default());

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 1);
    assert!(!checkpoints
        .is_completed("BINANCE", "BTCUSDT", Timeframe::H1, 2024, 1, None)
        .unwrap());
}

#[tokio::test]
async fn stop_signal_halts_before_the_next_unit() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    let mut source = MockSource::default();
    source.months.insert((2024, 1), hourly_bars(2024, 1, 24));
    let source = Arc::new(source);

    let stop = StopSignal::default();
    stop.stop();
    let fetcher = HistoryFetcher::new(
        store.clone(),
        Arc::clone(&checkpoints),
        source.clone(),
        Duration::ZERO,
        stop,
    );

    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.completed, 0);
    assert!(source.month_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bars_outside_the_requested_window_are_dropped() {
    let store = PartitionedStore::new(temp_root());
    let checkpoints = Arc::new(CheckpointStore::open_in_memory().unwrap());

    let mut source = MockSource::default();
    source.months.insert((2024, 1), hourly_bars(2024, 1, 48));
    let (fetcher, _) = fetcher(&store, &checkpoints, source);

    // Window covers only the first day of the archive.
    let req = request(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap(),
    );
    let report = fetcher.backfill(&req, &SilentProgress).await.unwrap();

    assert_eq!(report.rows_written, 24);
    let bars = store.read(&instrument(), Timeframe::H1, None, None).unwrap();
    assert_eq!(bars.len(), 24);
}
