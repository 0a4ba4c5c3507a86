//! Live kline feed over websocket.
//!
//! The exchange pushes one kline event per in-progress bar update; the `x`
//! flag inside the `k` payload flips to true exactly once, when the bar
//! closes. Consumers that persist data must act on [`BarEvent::Closed`] only.

use super::SyncError;
use crate::domain::{Bar, Instrument, Timeframe};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// One update from the live feed. `Open` carries the still-forming bar and is
/// informational; `Closed` is final and safe to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum BarEvent {
    Open(Bar),
    Closed(Bar),
}

impl BarEvent {
    pub fn bar(&self) -> &Bar {
        match self {
            BarEvent::Open(bar) | BarEvent::Closed(bar) => bar,
        }
    }
}

pub type BarStream = Pin<Box<dyn Stream<Item = Result<BarEvent, SyncError>> + Send>>;

/// A subscription-based live bar feed. The returned stream ends when the
/// connection drops; reconnecting is the caller's job.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    async fn subscribe(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<BarStream, SyncError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct BinanceLiveFeed {
    ws_url: String,
}

impl BinanceLiveFeed {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LiveFeed for BinanceLiveFeed {
    async fn subscribe(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> Result<BarStream, SyncError> {
        let url = format!(
            "{}/{}@kline_{}",
            self.ws_url,
            instrument.pair_code().to_lowercase(),
            timeframe
        );
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| SyncError::Network(format!("websocket connect to {url} failed: {e}")))?;
        debug!(url = %url, "websocket connected");

        let (write, read) = socket.split();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(read, write, tx));

        Ok(Box::pin(futures_util::stream::unfold(
            rx,
            |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
        )))
    }
}

/// Drive the socket: answer pings, parse kline frames, forward events. Ends
/// when the socket closes or the receiver is dropped.
async fn pump(mut read: WsSource, mut write: WsSink, tx: mpsc::Sender<Result<BarEvent, SyncError>>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(event) = parse_kline_event(&text) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                if write.send(Message::Pong(payload)).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("websocket closed by remote");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "websocket read error");
                let _ = tx
                    .send(Err(SyncError::Network(format!("websocket read: {e}"))))
                    .await;
                return;
            }
        }
    }
}

/// Decode one kline push. Non-kline frames (subscription acks, other event
/// types) return `None` and are skipped.
fn parse_kline_event(text: &str) -> Option<BarEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kline = value.get("k")?;

    let time = DateTime::from_timestamp_millis(kline.get("t")?.as_i64()?)?;
    let price = |key: &str| kline.get(key)?.as_str()?.parse::<f64>().ok();
    let bar = Bar {
        time,
        open: price("o")?,
        high: price("h")?,
        low: price("l")?,
        close: price("c")?,
        volume: price("v")?,
    };

    if kline.get("x")?.as_bool()? {
        Some(BarEvent::Closed(bar))
    } else {
        Some(BarEvent::Open(bar))
    }
}
