//! Engine configuration — the explicitly constructed context passed to callers.
//!
//! Loaded from a TOML file or built in code; every field has a working default
//! so tests can construct a config without touching the filesystem.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration for the ingestion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Root directory of the partitioned Parquet store.
    pub data_dir: PathBuf,
    /// Path of the checkpoint SQLite database.
    pub checkpoint_path: PathBuf,
    pub bulk: BulkConfig,
    pub rest: RestConfig,
    pub stream: StreamConfig,
}

/// Bulk archive source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub base_url: String,
    /// Market path segment under the base URL (`spot`, `futures/um`, ...).
    pub market: String,
    /// Fixed inter-unit delay in milliseconds (static throttle).
    pub request_delay_ms: u64,
    /// Retries per request before a unit is marked failed.
    pub max_retries: u32,
    /// Initial backoff in milliseconds; doubles per retry.
    pub base_backoff_ms: u64,
}

/// REST polling source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub base_url: String,
    /// Rows per page request.
    pub page_limit: u32,
    /// Bars of lookback when syncing a series with no stored data.
    pub lookback_bars: u32,
}

/// Streaming source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ws_url: String,
    /// Initial reconnect backoff in milliseconds; doubles up to the max.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Period of the reconciliation loop in seconds.
    pub reconcile_interval_secs: u64,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/bars"),
            checkpoint_path: PathBuf::from("data/checkpoints.db"),
            bulk: BulkConfig::default(),
            rest: RestConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.binance.vision/data".to_string(),
            market: "spot".to_string(),
            request_delay_ms: 500,
            max_retries: 3,
            base_backoff_ms: 1_000,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            page_limit: 1_000,
            lookback_bars: 1_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconcile_interval_secs: 300,
        }
    }
}

impl HiveConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = HiveConfig::default();
        assert_eq!(cfg.bulk.market, "spot");
        assert!(cfg.rest.page_limit > 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: HiveConfig = toml::from_str(
            r#"
            data_dir = "/tmp/bars"

            [bulk]
            request_delay_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/bars"));
        assert_eq!(cfg.bulk.request_delay_ms, 50);
        assert_eq!(cfg.bulk.max_retries, 3); // default retained
    }
}
