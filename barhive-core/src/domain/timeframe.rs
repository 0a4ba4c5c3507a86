//! Timeframe — enumerated bar durations with boundary arithmetic.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Seconds between the Unix epoch (a Thursday) and the preceding Monday.
/// Weekly bars open Monday 00:00 UTC, matching the bulk source's convention.
const MONDAY_EPOCH_OFFSET: i64 = 3 * 86_400;

/// Enumerated bar duration. Immutable, no identity beyond its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// Bar duration in seconds.
    pub fn duration_secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    /// Bar duration as a chrono `Duration`.
    pub fn duration(self) -> Duration {
        Duration::seconds(self.duration_secs())
    }

    /// Floor a timestamp to the open of the bar containing it.
    pub fn floor(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.duration_secs();
        let ts = t.timestamp() + self.boundary_offset();
        let floored = ts - ts.rem_euclid(secs) - self.boundary_offset();
        Utc.timestamp_opt(floored, 0).unwrap()
    }

    /// Ceil a timestamp to the next bar boundary (identity if already aligned).
    pub fn ceil(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(t);
        if floored == t {
            t
        } else {
            floored + self.duration()
        }
    }

    fn boundary_offset(self) -> i64 {
        match self {
            Timeframe::W1 => MONDAY_EPOCH_OFFSET,
            _ => 0,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TimeframeError {
    #[error("unrecognized timeframe '{0}'")]
    Unrecognized(String),
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            other => Err(TimeframeError::Unrecognized(other.to_string())),
        }
    }
}
