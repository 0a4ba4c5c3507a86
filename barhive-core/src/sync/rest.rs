//! REST kline source for recent history.

use super::SyncError;
use crate::config::RestConfig;
use crate::domain::{Bar, Instrument, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One kline as returned by the REST endpoint: numbers arrive as JSON
/// strings except the timestamps and trade count.
type RestKline = (
    i64,    // open time ms
    String, // open
    String, // high
    String, // low
    String, // close
    String, // volume
    i64,    // close time ms
    String, // quote volume
    i64,    // trade count
    String, // taker buy base
    String, // taker buy quote
    String, // unused
);

/// Paged recent-history source. Implementations return bars in ascending
/// time order, at most `limit` of them, starting at or after `since`.
#[async_trait]
pub trait RestSource: Send + Sync {
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Bar>, SyncError>;
}

pub struct BinanceRest {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRest {
    pub fn new(config: &RestConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RestSource for BinanceRest {
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Bar>, SyncError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", instrument.pair_code()),
            ("interval", timeframe.to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime", since.timestamp_millis().to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("kline request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Network(format!("kline request HTTP {status}")));
        }

        let rows: Vec<RestKline> = resp
            .json()
            .await
            .map_err(|e| SyncError::Parse(format!("kline response decode: {e}")))?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(kline_to_bar(row)?);
        }
        bars.sort_by_key(|b| b.time);
        Ok(bars)
    }
}

fn kline_to_bar(row: RestKline) -> Result<Bar, SyncError> {
    let price = |field: &str, value: &str| {
        value
            .parse::<f64>()
            .map_err(|e| SyncError::Parse(format!("bad {field} in kline: {e}")))
    };
    let time = DateTime::from_timestamp_millis(row.0)
        .ok_or_else(|| SyncError::Parse(format!("out-of-range kline timestamp: {}", row.0)))?;
    Ok(Bar {
        time,
        open: price("open", &row.1)?,
        high: price("high", &row.2)?,
        low: price("low", &row.3)?,
        close: price("close", &row.4)?,
        volume: price("volume", &row.5)?,
    })
}
