//! High-level query facade over the partitioned store.

use crate::domain::{Bar, Instrument, InstrumentError, Timeframe};
use crate::store::{PartitionedStore, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

/// One stored series with its on-disk extent.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

/// Read-side entry point for consumers: symbol-string queries, catalog
/// listing and on-the-fly aggregation to coarser timeframes.
pub struct DataManager {
    store: PartitionedStore,
}

impl DataManager {
    pub fn new(store: PartitionedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PartitionedStore {
        &self.store
    }

    /// Read bars for a flexibly-notated symbol (`BINANCE:BTC/USDT`,
    /// `btc-usdt`, `BTCUSDT`, ...), optionally window-bounded.
    pub fn get_history(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, ManagerError> {
        let instrument = Instrument::parse(exchange, symbol)?;
        Ok(self.store.read(&instrument, timeframe, start, end)?)
    }

    /// Read in one timeframe and aggregate up to a coarser one in memory.
    /// Useful when only the fine series is stored.
    pub fn get_history_at(
        &self,
        exchange: &str,
        symbol: &str,
        stored: Timeframe,
        target: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, ManagerError> {
        let bars = self.get_history(exchange, symbol, stored, start, end)?;
        if stored == target {
            return Ok(bars);
        }
        aggregate_to_higher_tf(&bars, stored, target)
    }

    /// Every stored series with its time extent, optionally limited to one
    /// exchange. Series whose partitions are all empty are omitted.
    pub fn list_available_data(
        &self,
        exchange: Option<&str>,
    ) -> Result<Vec<CatalogEntry>, ManagerError> {
        let mut catalog = Vec::new();
        for (instrument, timeframe) in self.store.list_instruments(exchange)? {
            if let Some((earliest, latest)) = self.store.get_range(&instrument, timeframe)? {
                catalog.push(CatalogEntry {
                    instrument,
                    timeframe,
                    earliest,
                    latest,
                });
            }
        }
        Ok(catalog)
    }
}

/// Roll bars up from a fine timeframe to a strictly coarser one. Each output
/// bar is keyed by the floored target boundary: open from the first source
/// bar, close from the last, high/low/volume aggregated across the bucket.
/// Buckets with missing source bars still aggregate whatever is present.
pub fn aggregate_to_higher_tf(
    bars: &[Bar],
    source: Timeframe,
    target: Timeframe,
) -> Result<Vec<Bar>, ManagerError> {
    if target.duration_secs() <= source.duration_secs() {
        return Err(ManagerError::Precondition(format!(
            "target timeframe {target} is not coarser than source {source}"
        )));
    }

    let mut out: Vec<Bar> = Vec::new();
    for bar in bars {
        let bucket = target.floor(bar.time);
        match out.last_mut() {
            Some(current) if current.time == bucket => {
                current.high = current.high.max(bar.high);
                current.low = current.low.min(bar.low);
                current.close = bar.close;
                current.volume += bar.volume;
            }
            _ => out.push(Bar {
                time: bucket,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }
    Ok(out)
}
