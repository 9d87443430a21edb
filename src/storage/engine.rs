//! The black-box storage engine interface. strata layers MVCC semantics on
//! any log-structured store that can provide these primitives; the crate
//! ships [`super::Memory`] as a reference implementation, and production
//! embeddings bind a durable LSM behind the same traits.
//!
//! Keys crossing this interface are always encoded MVCC sort keys, and the
//! store must order them with [`crate::encoding::mvcckey::compare`]. The
//! store is also expected to be configured with the MVCC merge operator
//! ([`super::merge::MvccMergeOperator`]) and to apply it to merge writes.

use super::batch::WriteBatch;
use crate::error::Result;
use crate::hlc::Timestamp;

use serde::{Deserialize, Serialize};

/// Options for opening an iterator.
#[derive(Clone, Debug, Default)]
pub struct IterOptions {
    /// Restricts iteration to keys sharing the user-key prefix of the first
    /// seeked key. Lets the store consult per-key bloom filters and skip
    /// unrelated tables.
    pub prefix_same_as_start: bool,
    /// Restricts iteration to tables whose recorded timestamp bounds
    /// intersect the given closed interval. The store filters at table
    /// granularity, so the iterator may still surface keys outside the
    /// interval; callers must re-check timestamps.
    pub time_bounds: Option<(Timestamp, Timestamp)>,
}

impl IterOptions {
    /// Options for a prefix iterator.
    pub fn prefix() -> Self {
        Self { prefix_same_as_start: true, ..Self::default() }
    }

    /// Options for a time-bound iterator over [min, max].
    pub fn time_bounded(min: Timestamp, max: Timestamp) -> Self {
        Self { time_bounds: Some((min, max)), ..Self::default() }
    }
}

/// A cursor-style iterator over encoded MVCC keys, in comparator order.
/// Movement methods return errors for unsupported or failed operations;
/// running off either end of the keyspace leaves the iterator invalid
/// without error. `key` and `value` must only be called while `valid`
/// returns true.
pub trait Iter {
    /// Positions at the first entry at or after the given encoded key.
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the last entry ordered strictly before the given encoded
    /// key. The reverse scanner depends on the strictness: seeking to a
    /// user key's metadata encoding must land on the previous user key even
    /// when the metadata row exists.
    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the first entry.
    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions at the last entry.
    fn seek_to_last(&mut self) -> Result<()>;

    /// Advances to the next entry. The iterator must be valid.
    fn next(&mut self) -> Result<()>;

    /// Moves back to the previous entry. The iterator must be valid.
    fn prev(&mut self) -> Result<()>;

    /// Returns true if the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// The current encoded key. Only valid until the next movement.
    fn key(&self) -> &[u8];

    /// The current value. Only valid until the next movement.
    fn value(&self) -> &[u8];
}

/// A point-in-time read view of a store. Holding a snapshot pins the view
/// for as long as the snapshot lives.
pub trait Snapshot {
    /// The iterator type returned by `iter`.
    type Iter: Iter;

    /// Gets a value by encoded key, if it exists.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Opens an iterator over the snapshot.
    fn iter(&self, opts: IterOptions) -> Result<Self::Iter>;
}

/// Metadata for one table (SST run) in the store, used by the compaction
/// planner and surfaced to operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SstMetadata {
    /// The LSM level holding the table.
    pub level: usize,
    /// The table's size in bytes.
    pub size: u64,
    /// The smallest encoded key in the table.
    #[serde(with = "serde_bytes")]
    pub smallest_key: Vec<u8>,
    /// The largest encoded key in the table.
    #[serde(with = "serde_bytes")]
    pub largest_key: Vec<u8>,
    /// The smallest version timestamp in the table, if it holds any
    /// versioned keys.
    pub ts_min: Option<Timestamp>,
    /// The largest version timestamp in the table.
    pub ts_max: Option<Timestamp>,
}

/// Operational statistics for a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Bytes buffered in memory awaiting a flush.
    pub memtable_total_size: u64,
    /// Number of flushes since the store was opened.
    pub flushes: i64,
    /// Number of compactions since the store was opened.
    pub compactions: i64,
    /// The shared block cache capacity visible to this store, if any.
    pub block_cache_capacity: i64,
}

/// A log-structured key/value store holding encoded MVCC keys in comparator
/// order. Implementations serialize writes internally; all methods take
/// shared references and may be called from multiple threads.
pub trait Store: std::fmt::Display + Send + Sync {
    /// The iterator type returned by `iter`.
    type Iter: Iter;
    /// The snapshot type returned by `snapshot`.
    type Snapshot: Snapshot<Iter = Self::Iter>;

    /// Sets a value for an encoded key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Records a merge operand for an encoded key. The configured merge
    /// operator combines operands with the stored value.
    fn merge(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes an encoded key, if it exists.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Deletes all keys in the encoded range [start, end).
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Gets a value by encoded key, if it exists.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Opens an iterator over the store. The iterator observes the store as
    /// of its creation; later writes are not visible.
    fn iter(&self, opts: IterOptions) -> Result<Self::Iter>;

    /// Takes a point-in-time snapshot of the store.
    fn snapshot(&self) -> Self::Snapshot;

    /// Atomically applies a write batch. With sync, the write is durable
    /// when this returns; otherwise durability follows store policy.
    fn write(&self, batch: &WriteBatch, sync: bool) -> Result<()>;

    /// Flushes buffered writes to the current table set.
    fn flush(&self) -> Result<()>;

    /// Returns metadata for all live tables.
    fn sst_metadata(&self) -> Result<Vec<SstMetadata>>;

    /// The number of LSM levels. The bottommost level is `num_levels() - 1`.
    fn num_levels(&self) -> usize;

    /// Compacts the encoded key range [start, end), unbounded where None.
    /// With force_bottommost, tables already in the bottommost level are
    /// rewritten too, so table-format and filter changes take effect.
    fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        force_bottommost: bool,
    ) -> Result<()>;

    /// Approximates the on-disk size of the encoded key range [start, end).
    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64>;

    /// Writes a file into the store's environment.
    fn env_write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Reads a file from the store's environment.
    fn env_read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Ingests a previously written SST run from the store's environment.
    /// With move_file, the source file is removed after ingestion.
    fn ingest_file(&self, path: &str, move_file: bool) -> Result<()>;

    /// Returns operational statistics.
    fn stats(&self) -> Result<StoreStats>;

    /// Returns a human-readable summary of compaction state.
    fn compaction_stats(&self) -> Result<String>;
}
