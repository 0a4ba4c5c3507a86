//! BarHive Core — multi-exchange OHLCV ingestion and partitioned storage.
//!
//! The engine has three moving parts layered over two stores:
//! - [`checkpoint::CheckpointStore`] — durable unit-of-work progress tracker (SQLite)
//! - [`store::PartitionedStore`] — compacting hive-partitioned Parquet store with
//!   range reads and gap detection
//! - [`fetch::HistoryFetcher`] — resumable bulk backfill from monthly/daily archives
//! - [`sync::RealtimeSyncer`] — live catch-up, gap backfill and streaming ingestion
//! - [`manager::DataManager`] — read-side facade for downstream consumers
//!
//! All instances are explicitly constructed and passed to callers; there are no
//! global singletons. A single logical writer per (instrument, timeframe,
//! partition) is assumed throughout — the stores are not engineered against
//! concurrent writers targeting the same key.

pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod fetch;
pub mod manager;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::HiveConfig;
pub use shutdown::StopSignal;
