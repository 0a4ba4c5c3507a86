//! Compaction strategies for partition rewrites.
//!
//! Every write to a pre-existing partition goes through a strategy's `merge`,
//! so an append-then-periodic-compact alternative can be swapped in without
//! touching callers. The default rewrites the whole partition into a sorted,
//! deduplicated run on every write.

use crate::domain::Bar;
use std::collections::BTreeMap;

/// Merges a partition's existing bars with an incoming batch.
///
/// Implementations must return the bars sorted ascending by timestamp. When
/// `dedupe` is set, duplicate timestamps keep the most recently written value
/// (incoming beats existing, later incoming beats earlier).
pub trait CompactionStrategy: Send + Sync {
    fn merge(&self, existing: Vec<Bar>, incoming: Vec<Bar>, dedupe: bool) -> Vec<Bar>;
}

/// Whole-partition read-merge-dedup-write compaction. Trades write
/// amplification for an always-sorted-and-deduped on-disk invariant.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteCompaction;

impl CompactionStrategy for RewriteCompaction {
    fn merge(&self, existing: Vec<Bar>, incoming: Vec<Bar>, dedupe: bool) -> Vec<Bar> {
        if dedupe {
            let mut by_ts: BTreeMap<i64, Bar> = BTreeMap::new();
            for bar in existing.into_iter().chain(incoming) {
                by_ts.insert(bar.time.timestamp_millis(), bar);
            }
            by_ts.into_values().collect()
        } else {
            let mut merged = existing;
            merged.extend(incoming);
            merged.sort_by_key(|b| b.time);
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn bar(ts_min: i64, close: f64) -> Bar {
        Bar {
            time: Utc.timestamp_opt(ts_min * 60, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn incoming_wins_on_duplicate_timestamp() {
        let existing = vec![bar(0, 1.0), bar(1, 2.0)];
        let incoming = vec![bar(1, 99.0)];
        let merged = RewriteCompaction.merge(existing, incoming, true);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].close, 99.0);
    }

    #[test]
    fn no_dedupe_keeps_duplicates_sorted() {
        let merged = RewriteCompaction.merge(vec![bar(1, 1.0)], vec![bar(1, 2.0), bar(0, 3.0)], false);
        let times: Vec<DateTime<Utc>> = merged.iter().map(|b| b.time).collect();
        assert_eq!(merged.len(), 3);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    proptest! {
        /// Merged output is always sorted with unique timestamps, regardless
        /// of input arrival order.
        #[test]
        fn merge_is_sorted_and_unique(
            existing_ts in proptest::collection::vec(0i64..500, 0..40),
            incoming_ts in proptest::collection::vec(0i64..500, 0..40),
        ) {
            let existing: Vec<Bar> = existing_ts.iter().map(|&t| bar(t, 1.0)).collect();
            let incoming: Vec<Bar> = incoming_ts.iter().map(|&t| bar(t, 2.0)).collect();
            let merged = RewriteCompaction.merge(existing, incoming, true);

            let times: Vec<i64> = merged.iter().map(|b| b.time.timestamp_millis()).collect();
            prop_assert!(times.windows(2).all(|w| w[0] < w[1]));

            // Every incoming timestamp must carry the incoming value.
            for &t in &incoming_ts {
                let found = merged
                    .iter()
                    .find(|b| b.time.timestamp() == t * 60)
                    .expect("incoming timestamp lost in merge");
                prop_assert_eq!(found.close, 2.0);
            }
        }
    }
}
