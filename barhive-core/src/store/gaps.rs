//! Gap detection over sorted bar runs.

use crate::domain::{Bar, Timeframe};
use chrono::{DateTime, Utc};

/// Jitter tolerance: consecutive bars further apart than this multiple of the
/// timeframe duration are treated as a gap. 1.5 tolerates minor timestamp
/// jitter while catching any single missing bar.
pub const GAP_TOLERANCE: f64 = 1.5;

/// A derived, non-persisted interval where expected bars are missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Walk a sorted bar run and emit a gap for each consecutive pair whose
/// spacing exceeds `GAP_TOLERANCE ×` the bar duration. The gap covers
/// `[prev + duration, curr − duration]`.
pub fn find_gaps(bars: &[Bar], timeframe: Timeframe) -> Vec<Gap> {
    let duration = timeframe.duration();
    let threshold = GAP_TOLERANCE * timeframe.duration_secs() as f64;

    bars.windows(2)
        .filter_map(|pair| {
            let delta = (pair[1].time - pair[0].time).num_seconds() as f64;
            if delta > threshold {
                Some(Gap {
                    start: pair[0].time + duration,
                    end: pair[1].time - duration,
                })
            } else {
                None
            }
        })
        .collect()
}
