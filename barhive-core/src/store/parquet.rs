//! Parquet (de)serialization of bar runs.
//!
//! Fixed schema: `ts` (millisecond UTC datetime), `open`, `high`, `low`,
//! `close`, `volume` (all Float64). One file per partition.

use super::StoreError;
use crate::domain::Bar;
use chrono::DateTime;
use polars::prelude::*;
use std::fs;
use std::path::Path;

const COLUMNS: [&str; 6] = ["ts", "open", "high", "low", "close", "volume"];

pub(super) fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame, StoreError> {
    let ts: Vec<i64> = bars.iter().map(|b| b.time.timestamp_millis()).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("ts".into(), ts)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| StoreError::Parquet(format!("ts cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

pub(super) fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<Bar>, StoreError> {
    let col = |name: &str| {
        df.column(name)
            .map_err(|e| StoreError::Parquet(format!("column read: {e}")))
    };

    let ts_ca = col("ts")?
        .datetime()
        .map_err(|e| StoreError::Parquet(format!("ts column type: {e}")))?
        .clone();
    let open_ca = col("open")?
        .f64()
        .map_err(|e| StoreError::Parquet(format!("open column type: {e}")))?
        .clone();
    let high_ca = col("high")?
        .f64()
        .map_err(|e| StoreError::Parquet(format!("high column type: {e}")))?
        .clone();
    let low_ca = col("low")?
        .f64()
        .map_err(|e| StoreError::Parquet(format!("low column type: {e}")))?
        .clone();
    let close_ca = col("close")?
        .f64()
        .map_err(|e| StoreError::Parquet(format!("close column type: {e}")))?
        .clone();
    let vol_ca = col("volume")?
        .f64()
        .map_err(|e| StoreError::Parquet(format!("volume column type: {e}")))?
        .clone();

    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ts_ms = ts_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null ts at row {i}")))?;
        let time = DateTime::from_timestamp_millis(ts_ms)
            .ok_or_else(|| StoreError::Parquet(format!("out-of-range ts {ts_ms} at row {i}")))?;

        bars.push(Bar {
            time,
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(f64::NAN),
        });
    }
    Ok(bars)
}

pub(super) fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

/// Load a partition file and validate its shape before converting.
pub(super) fn read_parquet(path: &Path) -> Result<Vec<Bar>, StoreError> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read parquet: {e}")))?;

    if df.height() == 0 {
        return Err(StoreError::Validation("empty partition file".into()));
    }
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Validation(format!("missing column '{name}'")));
        }
    }

    dataframe_to_bars(&df)
}
