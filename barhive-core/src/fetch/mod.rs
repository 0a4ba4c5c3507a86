//! Historical bulk ingestion: archive sources and the backfill orchestrator.

pub mod history;
pub mod http;
pub mod progress;
pub mod source;

pub use history::{BackfillRequest, HistoryFetcher};
pub use http::HttpBulkSource;
pub use progress::{FetchProgress, FetchReport, LogProgress, SilentProgress};
pub use source::{BulkChunk, BulkSource, FetchError};
