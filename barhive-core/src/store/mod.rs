//! PartitionedStore — compacting columnar time-series store.
//!
//! Layout: `{root}/{EXCHANGE}/{BASE}_{QUOTE}/{timeframe}/year={YYYY}/month={MM}/data.parquet`
//!
//! One Parquet file per (instrument, timeframe, year, month) partition,
//! created lazily on first write and rewritten wholesale (read-merge-dedup-
//! write) on every subsequent write touching it — never appended in place.
//! Writes are atomic (`.tmp` + rename); unreadable partition files are
//! quarantined on load rather than failing the read. The directory naming
//! convention doubles as a self-describing catalog.
//!
//! Timestamps are UTC throughout; values are plain 64-bit floats. Single
//! logical writer per partition is assumed, not enforced.

pub mod compaction;
pub mod gaps;
mod parquet;

pub use compaction::{CompactionStrategy, RewriteCompaction};
pub use gaps::{find_gaps, Gap, GAP_TOLERANCE};

use crate::domain::{Bar, Instrument, Timeframe};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("partition validation error: {0}")]
    Validation(String),
}

/// The partitioned Parquet store. Cheap to clone; clones share the root and
/// compaction strategy.
#[derive(Clone)]
pub struct PartitionedStore {
    root: PathBuf,
    compaction: Arc<dyn CompactionStrategy>,
}

impl PartitionedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_compaction(root, Arc::new(RewriteCompaction))
    }

    pub fn with_compaction(root: impl Into<PathBuf>, compaction: Arc<dyn CompactionStrategy>) -> Self {
        Self {
            root: root.into(),
            compaction,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self, instrument: &Instrument, timeframe: Timeframe) -> PathBuf {
        self.root
            .join(&instrument.exchange)
            .join(instrument.dir_name())
            .join(timeframe.to_string())
    }

    fn partition_path(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.series_dir(instrument, timeframe)
            .join(format!("year={year:04}"))
            .join(format!("month={month:02}"))
            .join("data.parquet")
    }

    /// Write a batch of bars, bucketed by covering partition. Each touched
    /// partition is loaded, merged through the compaction strategy, and
    /// atomically replaced. Returns the net new-row delta across partitions.
    pub fn write(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        bars: &[Bar],
        dedupe: bool,
    ) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut by_partition: BTreeMap<(i32, u32), Vec<Bar>> = BTreeMap::new();
        for bar in bars {
            by_partition
                .entry((bar.time.year(), bar.time.month()))
                .or_default()
                .push(bar.clone());
        }

        let mut new_rows = 0usize;
        for ((year, month), batch) in by_partition {
            let path = self.partition_path(instrument, timeframe, year, month);
            let existing = if path.exists() {
                self.load_partition(&path)
            } else {
                Vec::new()
            };
            let existing_len = existing.len();

            let merged = self.compaction.merge(existing, batch, dedupe);
            new_rows += merged.len().saturating_sub(existing_len);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let df = parquet::bars_to_dataframe(&merged)?;
            let tmp = path.with_extension("parquet.tmp");
            parquet::write_parquet(&df, &tmp)?;
            fs::rename(&tmp, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                StoreError::Io(e)
            })?;
        }
        Ok(new_rows)
    }

    /// Read bars over an inclusive `[start, end]` range (open bounds allowed),
    /// scanning only the overlapping partitions. Result is sorted ascending.
    pub fn read(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, StoreError> {
        let mut bars = Vec::new();
        for (year, month, path) in self.list_partitions(instrument, timeframe)? {
            let (p_start, p_end) = month_bounds(year, month);
            if start.is_some_and(|s| p_end < s) || end.is_some_and(|e| p_start > e) {
                continue;
            }
            bars.extend(self.load_partition(&path));
        }

        bars.retain(|b| {
            start.map_or(true, |s| b.time >= s) && end.map_or(true, |e| b.time <= e)
        });
        bars.sort_by_key(|b| b.time);
        Ok(bars)
    }

    /// Earliest and latest stored timestamps, or `None` for an empty series.
    pub fn get_range(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let partitions = self.list_partitions(instrument, timeframe)?;

        let mut earliest = None;
        for (_, _, path) in &partitions {
            let bars = self.load_partition(path);
            if let Some(first) = bars.first() {
                earliest = Some(first.time);
                break;
            }
        }
        let mut latest = None;
        for (_, _, path) in partitions.iter().rev() {
            let bars = self.load_partition(path);
            if let Some(last) = bars.last() {
                latest = Some(last.time);
                break;
            }
        }

        Ok(earliest.zip(latest))
    }

    /// Detect gaps in the stored run over an optional range.
    pub fn detect_gaps(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Gap>, StoreError> {
        let bars = self.read(instrument, timeframe, start, end)?;
        Ok(find_gaps(&bars, timeframe))
    }

    /// Delete stored bars. A full-range delete removes the whole series tree;
    /// a bounded delete is read-filter-rewrite across every partition, since a
    /// range can span several of them.
    pub fn delete(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let series = self.series_dir(instrument, timeframe);
        if start.is_none() && end.is_none() {
            if series.exists() {
                fs::remove_dir_all(&series)?;
            }
            return Ok(());
        }

        for (_, _, path) in self.list_partitions(instrument, timeframe)? {
            let bars = self.load_partition(&path);
            let kept: Vec<Bar> = bars
                .iter()
                .filter(|b| {
                    !(start.map_or(true, |s| b.time >= s) && end.map_or(true, |e| b.time <= e))
                })
                .cloned()
                .collect();

            if kept.len() == bars.len() {
                continue;
            }
            if kept.is_empty() {
                fs::remove_file(&path)?;
                // Prune now-empty month/year directories, best effort.
                if let Some(month_dir) = path.parent() {
                    let _ = fs::remove_dir(month_dir);
                    if let Some(year_dir) = month_dir.parent() {
                        let _ = fs::remove_dir(year_dir);
                    }
                }
            } else {
                let df = parquet::bars_to_dataframe(&kept)?;
                let tmp = path.with_extension("parquet.tmp");
                parquet::write_parquet(&df, &tmp)?;
                fs::rename(&tmp, &path)?;
            }
        }
        Ok(())
    }

    /// Does the partition file for (year, month) physically exist?
    pub fn partition_exists(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        year: i32,
        month: u32,
    ) -> bool {
        self.partition_path(instrument, timeframe, year, month).exists()
    }

    /// Enumerate stored series by introspecting the directory layout,
    /// optionally narrowed to one exchange.
    pub fn list_instruments(
        &self,
        exchange: Option<&str>,
    ) -> Result<Vec<(Instrument, Timeframe)>, StoreError> {
        let mut series = Vec::new();
        if !self.root.exists() {
            return Ok(series);
        }

        for exchange_entry in fs::read_dir(&self.root)? {
            let exchange_entry = exchange_entry?;
            if !exchange_entry.path().is_dir() {
                continue;
            }
            let exchange_name = exchange_entry.file_name().to_string_lossy().to_string();
            if exchange.is_some_and(|e| !e.eq_ignore_ascii_case(&exchange_name)) {
                continue;
            }

            for pair_entry in fs::read_dir(exchange_entry.path())? {
                let pair_entry = pair_entry?;
                if !pair_entry.path().is_dir() {
                    continue;
                }
                let pair_name = pair_entry.file_name().to_string_lossy().to_string();
                let Some((base, quote)) = pair_name.split_once('_') else {
                    continue;
                };

                for tf_entry in fs::read_dir(pair_entry.path())? {
                    let tf_entry = tf_entry?;
                    if !tf_entry.path().is_dir() {
                        continue;
                    }
                    let tf_name = tf_entry.file_name().to_string_lossy().to_string();
                    if let Ok(timeframe) = Timeframe::from_str(&tf_name) {
                        series.push((Instrument::new(&exchange_name, base, quote), timeframe));
                    }
                }
            }
        }

        series.sort_by(|a, b| {
            (a.0.canonical(), a.1.duration_secs()).cmp(&(b.0.canonical(), b.1.duration_secs()))
        });
        Ok(series)
    }

    /// Partition files for one series, sorted by (year, month).
    fn list_partitions(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<Vec<(i32, u32, PathBuf)>, StoreError> {
        let series = self.series_dir(instrument, timeframe);
        let mut partitions = Vec::new();
        if !series.exists() {
            return Ok(partitions);
        }

        for year_entry in fs::read_dir(&series)? {
            let year_entry = year_entry?;
            let year_name = year_entry.file_name().to_string_lossy().to_string();
            let Some(year) = year_name.strip_prefix("year=").and_then(|y| y.parse().ok()) else {
                continue;
            };

            for month_entry in fs::read_dir(year_entry.path())? {
                let month_entry = month_entry?;
                let month_name = month_entry.file_name().to_string_lossy().to_string();
                let Some(month) = month_name
                    .strip_prefix("month=")
                    .and_then(|m| m.parse().ok())
                    .filter(|m| (1..=12).contains(m))
                else {
                    continue;
                };

                let path = month_entry.path().join("data.parquet");
                if path.exists() {
                    partitions.push((year, month, path));
                }
            }
        }

        partitions.sort_by_key(|(year, month, _)| (*year, *month));
        Ok(partitions)
    }

    /// Load one partition file. Unreadable files are quarantined and treated
    /// as empty so one corrupt partition never fails a whole read.
    fn load_partition(&self, path: &Path) -> Vec<Bar> {
        match parquet::read_parquet(path) {
            Ok(bars) => bars,
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "quarantining unreadable partition file"
                );
                let _ = fs::rename(path, &quarantine);
                Vec::new()
            }
        }
    }
}

/// First and last instant covered by a calendar month, in UTC.
fn month_bounds(year: i32, month: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap();
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let next_start = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).unwrap();
    (start, next_start - chrono::Duration::milliseconds(1))
}
