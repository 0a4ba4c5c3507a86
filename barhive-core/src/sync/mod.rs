//! Realtime synchronization: REST catch-up, gap repair and live streaming.
//!
//! The syncer closes the distance between the bulk-archived past and now in
//! three moves: page recent bars over REST from the last stored timestamp,
//! repair any interior gaps the store can still see, then hold a websocket
//! subscription and persist each bar the moment it closes. Partition writes
//! always dedupe, so overlap between the three paths is harmless.

pub mod rest;
pub mod stream;

pub use rest::{BinanceRest, RestSource};
pub use stream::{BarEvent, BarStream, BinanceLiveFeed, LiveFeed};

use crate::config::{RestConfig, StreamConfig};
use crate::domain::{Bar, Instrument, Timeframe};
use crate::shutdown::StopSignal;
use crate::store::{Gap, PartitionedStore, StoreError};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A paging cursor failed to advance; aborted rather than spinning on the
    /// same request forever.
    #[error("no forward progress at cursor {cursor}")]
    NoProgress { cursor: DateTime<Utc> },

    #[error("task failure: {0}")]
    Task(String),
}

pub struct RealtimeSyncer {
    store: PartitionedStore,
    rest: Arc<dyn RestSource>,
    feed: Arc<dyn LiveFeed>,
    page_limit: u32,
    lookback_bars: u32,
    reconnect_base: Duration,
    reconnect_max: Duration,
    stop: StopSignal,
    /// Highest persisted close-time per series, for stream-side dedupe across
    /// reconnects.
    watermarks: Mutex<HashMap<(Instrument, Timeframe), DateTime<Utc>>>,
}

impl RealtimeSyncer {
    pub fn new(
        store: PartitionedStore,
        rest: Arc<dyn RestSource>,
        feed: Arc<dyn LiveFeed>,
        rest_config: &RestConfig,
        stream_config: &StreamConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            rest,
            feed,
            page_limit: rest_config.page_limit,
            lookback_bars: rest_config.lookback_bars,
            reconnect_base: Duration::from_millis(stream_config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(stream_config.reconnect_max_ms),
            stop,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Page forward from the last stored bar (or a bounded lookback for an
    /// empty series) until caught up with the present. Returns rows written.
    pub async fn sync_to_latest(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<usize, SyncError> {
        let step = timeframe.duration();
        let mut cursor = match self.stored_range(instrument, timeframe).await? {
            Some((_, latest)) => latest + step,
            None => Utc::now() - step * self.lookback_bars as i32,
        };

        let mut written = 0;
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let page = self
                .rest
                .fetch_bars(instrument, timeframe, Some(cursor), Some(self.page_limit))
                .await?;
            let page_len = page.len();
            // Lower bound guards against sources that ignore `since`.
            let closed: Vec<Bar> = page
                .into_iter()
                .filter(|b| b.time >= cursor && b.is_sane() && b.time + step <= Utc::now())
                .collect();

            match closed.last() {
                Some(last) => {
                    let next = last.time + step;
                    written += self.persist(instrument, timeframe, closed.clone()).await?;
                    self.advance_watermark(instrument, timeframe, last.time);
                    if next <= cursor {
                        return Err(SyncError::NoProgress { cursor });
                    }
                    cursor = next;
                }
                // Nothing closed in this page; asking again from the same
                // cursor cannot make progress.
                None => break,
            }

            // A short page means the exchange has nothing further yet.
            if page_len < self.page_limit as usize {
                break;
            }
        }

        debug!(
            series = %instrument.canonical(),
            timeframe = %timeframe,
            rows = written,
            "rest catch-up done"
        );
        Ok(written)
    }

    /// Fill one known gap by paging REST bars across it.
    pub async fn backfill_gap(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        gap: &Gap,
    ) -> Result<usize, SyncError> {
        let step = timeframe.duration();
        let mut cursor = gap.start;
        let mut written = 0;

        while cursor <= gap.end {
            if self.stop.is_stopped() {
                break;
            }
            let page = self
                .rest
                .fetch_bars(instrument, timeframe, Some(cursor), Some(self.page_limit))
                .await?;
            let in_gap: Vec<Bar> = page
                .into_iter()
                .filter(|b| b.time >= cursor && b.time <= gap.end && b.is_sane())
                .collect();
            let Some(last) = in_gap.last() else {
                // The exchange has no data here (delisting window, outage).
                // Nothing more will appear by asking again.
                break;
            };
            let next = last.time + step;
            written += self.persist(instrument, timeframe, in_gap.clone()).await?;
            if next <= cursor {
                return Err(SyncError::NoProgress { cursor });
            }
            cursor = next;
        }
        Ok(written)
    }

    /// Detect gaps in the stored window and repair each. Returns rows written.
    pub async fn check_and_fill_gaps(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize, SyncError> {
        let gaps = {
            let store = self.store.clone();
            let instrument = instrument.clone();
            tokio::task::spawn_blocking(move || {
                store.detect_gaps(&instrument, timeframe, start, end)
            })
            .await
            .map_err(|e| SyncError::Task(format!("gap scan task: {e}")))??
        };

        if !gaps.is_empty() {
            info!(
                series = %instrument.canonical(),
                timeframe = %timeframe,
                gaps = gaps.len(),
                "repairing gaps"
            );
        }
        let mut written = 0;
        for gap in &gaps {
            if self.stop.is_stopped() {
                break;
            }
            written += self.backfill_gap(instrument, timeframe, gap).await?;
        }
        Ok(written)
    }

    /// Hold a live subscription until stopped, persisting each closed bar.
    /// Disconnects are retried forever with capped doubling backoff; the
    /// backoff resets once a connection has produced an event.
    pub async fn run_stream(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<(), SyncError> {
        let mut backoff = self.reconnect_base;

        while !self.stop.is_stopped() {
            let mut stream = match self.feed.subscribe(instrument, timeframe).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        series = %instrument.canonical(),
                        error = %e,
                        delay_ms = backoff.as_millis() as u64,
                        "subscribe failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.reconnect_max);
                    continue;
                }
            };

            while let Some(event) = stream.next().await {
                if self.stop.is_stopped() {
                    return Ok(());
                }
                match event {
                    Ok(BarEvent::Closed(bar)) => {
                        backoff = self.reconnect_base;
                        if !bar.is_sane() || !self.is_above_watermark(instrument, timeframe, bar.time)
                        {
                            continue;
                        }
                        self.persist(instrument, timeframe, vec![bar.clone()]).await?;
                        self.advance_watermark(instrument, timeframe, bar.time);
                    }
                    Ok(BarEvent::Open(_)) => {
                        backoff = self.reconnect_base;
                    }
                    Err(e) => {
                        warn!(series = %instrument.canonical(), error = %e, "stream error");
                        break;
                    }
                }
            }

            if self.stop.is_stopped() {
                break;
            }
            warn!(
                series = %instrument.canonical(),
                delay_ms = backoff.as_millis() as u64,
                "stream ended, reconnecting"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.reconnect_max);
        }
        Ok(())
    }

    /// Periodic catch-up plus gap repair for a set of series. Runs until
    /// stopped; per-series errors are logged and do not end the loop.
    pub async fn run_reconciliation(
        &self,
        series: &[(Instrument, Timeframe)],
        interval: Duration,
    ) {
        while !self.stop.is_stopped() {
            for (instrument, timeframe) in series {
                if self.stop.is_stopped() {
                    return;
                }
                if let Err(e) = self.sync_to_latest(instrument, *timeframe).await {
                    warn!(series = %instrument.canonical(), error = %e, "reconciliation catch-up failed");
                }
                let lookback =
                    Utc::now() - timeframe.duration() * self.lookback_bars as i32;
                if let Err(e) = self
                    .check_and_fill_gaps(instrument, *timeframe, Some(lookback), None)
                    .await
                {
                    warn!(series = %instrument.canonical(), error = %e, "reconciliation gap repair failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn stored_range(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, SyncError> {
        let store = self.store.clone();
        let instrument = instrument.clone();
        tokio::task::spawn_blocking(move || store.get_range(&instrument, timeframe))
            .await
            .map_err(|e| SyncError::Task(format!("range scan task: {e}")))?
            .map_err(SyncError::from)
    }

    async fn persist(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        bars: Vec<Bar>,
    ) -> Result<usize, SyncError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let store = self.store.clone();
        let instrument = instrument.clone();
        tokio::task::spawn_blocking(move || store.write(&instrument, timeframe, &bars, true))
            .await
            .map_err(|e| SyncError::Task(format!("storage task: {e}")))?
            .map_err(SyncError::from)
    }

    fn is_above_watermark(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        time: DateTime<Utc>,
    ) -> bool {
        let watermarks = self.watermarks.lock().unwrap();
        watermarks
            .get(&(instrument.clone(), timeframe))
            .map_or(true, |hwm| time > *hwm)
    }

    fn advance_watermark(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        time: DateTime<Utc>,
    ) {
        let mut watermarks = self.watermarks.lock().unwrap();
        let entry = watermarks
            .entry((instrument.clone(), timeframe))
            .or_insert(time);
        if time > *entry {
            *entry = time;
        }
    }
}
