//! Time-bound table properties. Every table (SST run) records the minimum
//! and maximum version timestamp it contains, under the user property keys
//! `crdb.ts.min` and `crdb.ts.max` (the names are an on-disk format shared
//! with other readers and must not change). Time-bound iterators use the
//! recorded bounds to skip tables that cannot contain versions in the
//! queried interval, which makes incremental scans over recent writes cheap.
//!
//! Properties store the raw big-endian timestamp encoding without the NUL
//! prefix guard, so plain lexicographic comparison of property values is
//! order-equivalent to timestamp comparison.

use crate::encoding::mvcckey;
use crate::error::Result;
use crate::hlc::Timestamp;

use serde::{Deserialize, Serialize};

/// The user property key recording a table's minimum version timestamp.
pub const TS_MIN_PROPERTY: &str = "crdb.ts.min";
/// The user property key recording a table's maximum version timestamp.
pub const TS_MAX_PROPERTY: &str = "crdb.ts.max";

/// The recorded timestamp bounds of one table. Empty bounds mean the table
/// held no versioned keys (or predates bound collection) and must be assumed
/// to cover everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Raw encoding of the smallest version timestamp, or empty.
    #[serde(with = "serde_bytes")]
    pub min: Vec<u8>,
    /// Raw encoding of the largest version timestamp, or empty.
    #[serde(with = "serde_bytes")]
    pub max: Vec<u8>,
}

impl TimeBounds {
    /// Decodes the minimum bound, if recorded.
    pub fn min_timestamp(&self) -> Result<Option<Timestamp>> {
        if self.min.is_empty() {
            return Ok(None);
        }
        mvcckey::decode_timestamp(&self.min).map(Some)
    }

    /// Decodes the maximum bound, if recorded.
    pub fn max_timestamp(&self) -> Result<Option<Timestamp>> {
        if self.max.is_empty() {
            return Ok(None);
        }
        mvcckey::decode_timestamp(&self.max).map(Some)
    }

    /// The table filter predicate: returns true if a table with these bounds
    /// may contain versions in the closed interval [min, max]. Tables with
    /// missing bounds are included unconditionally.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        if self.min.is_empty() || self.max.is_empty() {
            return true;
        }
        let query_min = mvcckey::encode_timestamp(min);
        let query_max = mvcckey::encode_timestamp(max);
        query_max.as_slice() >= self.min.as_slice() && query_min.as_slice() <= self.max.as_slice()
    }

    /// Folds another table's bounds into these, as when tables merge during
    /// compaction. Missing bounds on either side poison the result, since
    /// the merged table's contents are no longer bounded.
    pub fn union(&mut self, other: &TimeBounds) {
        if self.min.is_empty() || self.max.is_empty() {
            return;
        }
        if other.min.is_empty() || other.max.is_empty() {
            *self = TimeBounds::default();
            return;
        }
        if other.min < self.min {
            self.min = other.min.clone();
        }
        if other.max > self.max {
            self.max = other.max.clone();
        }
    }
}

/// Collects time-bound properties while a table is written: the minimum and
/// maximum timestamp encoding observed across its keys. Metadata keys carry
/// no timestamp and do not contribute.
#[derive(Clone, Debug, Default)]
pub struct TimeBoundCollector {
    ts_min: Vec<u8>,
    ts_max: Vec<u8>,
}

impl TimeBoundCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an encoded key. Undecodable keys are skipped; the collector
    /// is best-effort and the bounds only ever widen the filter.
    pub fn add(&mut self, encoded_key: &[u8]) {
        let Ok((_, ts)) = mvcckey::split_key(encoded_key) else {
            return;
        };
        if ts.is_empty() {
            return;
        }
        let ts = &ts[1..]; // strip the NUL prefix guard
        if self.ts_max.is_empty() || ts > self.ts_max.as_slice() {
            self.ts_max = ts.to_vec();
        }
        if self.ts_min.is_empty() || ts < self.ts_min.as_slice() {
            self.ts_min = ts.to_vec();
        }
    }

    /// Finishes collection, producing the table's bounds.
    pub fn finish(self) -> TimeBounds {
        TimeBounds { min: self.ts_min, max: self.ts_max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::mvcckey::encode_key;

    fn ts(wall: i64, logical: i32) -> Timestamp {
        Timestamp::new(wall, logical)
    }

    #[test]
    fn collector_bounds() {
        let mut collector = TimeBoundCollector::new();
        collector.add(&encode_key(b"a", ts(5, 0)));
        collector.add(&encode_key(b"b", ts(2, 3)));
        collector.add(&encode_key(b"c", Timestamp::ZERO)); // metadata, ignored
        collector.add(&encode_key(b"d", ts(9, 1)));
        collector.add(b"\xff"); // undecodable, ignored

        let bounds = collector.finish();
        assert_eq!(bounds.min_timestamp().unwrap(), Some(ts(2, 3)));
        assert_eq!(bounds.max_timestamp().unwrap(), Some(ts(9, 1)));

        // Raw property bytes carry no NUL prefix.
        assert_eq!(bounds.max, mvcckey::encode_timestamp(ts(9, 1)));
    }

    #[test]
    fn collector_of_metadata_only_is_empty() {
        let mut collector = TimeBoundCollector::new();
        collector.add(&encode_key(b"a", Timestamp::ZERO));
        let bounds = collector.finish();
        assert_eq!(bounds, TimeBounds::default());
        assert_eq!(bounds.min_timestamp().unwrap(), None);
    }

    #[test]
    fn filter_intersection() {
        let mut collector = TimeBoundCollector::new();
        collector.add(&encode_key(b"a", ts(10, 0)));
        collector.add(&encode_key(b"b", ts(20, 0)));
        let bounds = collector.finish();

        // Overlapping intervals are included.
        assert!(bounds.overlaps(ts(5, 0), ts(15, 0)));
        assert!(bounds.overlaps(ts(15, 0), ts(25, 0)));
        assert!(bounds.overlaps(ts(12, 0), ts(13, 0)));
        assert!(bounds.overlaps(ts(0, 0), ts(100, 0)));
        // Closed-interval endpoints count as overlap.
        assert!(bounds.overlaps(ts(20, 0), ts(30, 0)));
        assert!(bounds.overlaps(ts(1, 0), ts(10, 0)));
        // Disjoint intervals are excluded.
        assert!(!bounds.overlaps(ts(1, 0), ts(9, 0)));
        assert!(!bounds.overlaps(ts(21, 0), ts(30, 0)));

        // Missing bounds include unconditionally.
        assert!(TimeBounds::default().overlaps(ts(1, 0), ts(2, 0)));
    }

    #[test]
    fn union_widens_or_poisons() {
        let collect = |stamps: &[Timestamp]| {
            let mut c = TimeBoundCollector::new();
            for &t in stamps {
                c.add(&encode_key(b"k", t));
            }
            c.finish()
        };

        let mut a = collect(&[ts(5, 0), ts(10, 0)]);
        let b = collect(&[ts(2, 0), ts(7, 0)]);
        a.union(&b);
        assert_eq!(a.min_timestamp().unwrap(), Some(ts(2, 0)));
        assert_eq!(a.max_timestamp().unwrap(), Some(ts(10, 0)));

        let mut c = collect(&[ts(5, 0)]);
        c.union(&TimeBounds::default());
        assert_eq!(c, TimeBounds::default());
    }
}
