//! Hybrid-logical clock timestamps. strata does not contain a clock source;
//! timestamps are assigned by the caller and treated as opaque version
//! identifiers with a total order.

use serde::{Deserialize, Serialize};

/// A hybrid-logical clock timestamp: wall time in nanoseconds with a logical
/// tiebreaker for events within the same nanosecond. Ordering is
/// lexicographic on (wall_time, logical), which the derived implementations
/// provide. The zero timestamp is reserved as a sentinel for metadata rows
/// and never identifies a version.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall time in nanoseconds since the Unix epoch.
    pub wall_time: i64,
    /// Logical tiebreaker within a wall time reading.
    pub logical: i32,
}

impl Timestamp {
    /// The zero timestamp, used for metadata rows.
    pub const ZERO: Timestamp = Timestamp { wall_time: 0, logical: 0 };

    /// Creates a new timestamp.
    pub fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    /// Returns true if this is the zero timestamp.
    pub fn is_zero(&self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// Returns the timestamp immediately before this one. The zero timestamp
    /// has no predecessor; callers must not ask for one.
    pub fn prev(&self) -> Timestamp {
        assert!(!self.is_zero(), "no previous time for zero timestamp");
        if self.logical > 0 {
            Timestamp { wall_time: self.wall_time, logical: self.logical - 1 }
        } else {
            Timestamp { wall_time: self.wall_time - 1, logical: i32::MAX }
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        let ts = |w, l| Timestamp::new(w, l);
        assert!(ts(0, 0) < ts(0, 1));
        assert!(ts(0, 1) < ts(1, 0));
        assert!(ts(1, 0) < ts(1, 1));
        assert!(ts(1, i32::MAX) < ts(2, 0));
        assert_eq!(ts(3, 2), ts(3, 2));
        assert!(Timestamp::ZERO.is_zero());
        assert!(!ts(0, 1).is_zero());
    }

    #[test]
    fn prev() {
        assert_eq!(Timestamp::new(5, 3).prev(), Timestamp::new(5, 2));
        assert_eq!(Timestamp::new(5, 0).prev(), Timestamp::new(4, i32::MAX));
    }

    #[test]
    #[should_panic(expected = "no previous time")]
    fn prev_of_zero() {
        Timestamp::ZERO.prev();
    }
}
