//! The engine façade: a uniform operation set over four backings. A `Db`
//! engine writes straight to the store; a `Batch` engine buffers writes in
//! an indexed batch and serves read-your-writes reads over the store; a
//! `WriteBatch` engine buffers writes without read support; a `Snapshot`
//! engine serves reads from a pinned view and rejects writes. Unsupported
//! backing/operation combinations return an explicit unsupported error.
//!
//! Also home to the open [`Options`] and the process-wide block [`Cache`]
//! wrapper shared between stores.

use super::batch::{IndexedBatch, WriteBatch};
use super::engine::{Iter, IterOptions, Snapshot, Store, StoreStats};
use super::overlay::OverlayIter;
use crate::encoding::mvcckey::{compare, decode_key, encode_key};
use crate::error::Result;
use crate::hlc::Timestamp;

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

/// The size of the in-memory write buffer flushed to level-0 tables.
pub const WRITE_BUFFER_SIZE: u64 = 64 << 20;

/// A shared handle on the process-wide block cache. Stores opening against
/// the same cache share its capacity; each open reserves one write buffer
/// worth of memory for memtable headroom. Cloning the handle shares the
/// underlying cache.
#[derive(Clone, Debug)]
pub struct Cache {
    capacity: Arc<Mutex<i64>>,
}

impl Cache {
    /// Creates a cache with the given capacity in bytes.
    pub fn new(capacity: i64) -> Self {
        Self { capacity: Arc::new(Mutex::new(capacity)) }
    }

    /// The current capacity in bytes.
    pub fn capacity(&self) -> i64 {
        *self.capacity.lock().expect("lock poisoned")
    }

    /// Permanently reserves bytes out of the cache capacity.
    pub(super) fn reserve(&self, bytes: i64) {
        let mut capacity = self.capacity.lock().expect("lock poisoned");
        *capacity = (*capacity - bytes).max(0);
    }
}

/// Options for opening a store.
#[derive(Clone, Debug)]
pub struct Options {
    /// The shared block cache, if any.
    pub cache: Option<Cache>,
    /// CPU parallelism hint for background work.
    pub num_cpu: usize,
    /// How long to retain write-ahead logs, for replication catch-up.
    pub wal_ttl_seconds: u64,
    /// Whether to forward engine-internal log output.
    pub logging_enabled: bool,
    /// File descriptor budget for open tables.
    pub max_open_files: i32,
    /// Table block size in bytes.
    pub block_size: usize,
    /// Refuse to create the store if it does not already exist.
    pub must_exist: bool,
    /// Wrap the environment in a redirection layer.
    pub use_switching_env: bool,
    /// Opaque configuration for licensed extensions. Rejected when
    /// non-empty by builds without such extensions.
    pub extra_options: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache: None,
            num_cpu: 2,
            wal_ttl_seconds: 0,
            logging_enabled: false,
            max_open_files: -1,
            block_size: 32 << 10,
            must_exist: false,
            use_switching_env: false,
            extra_options: Vec::new(),
        }
    }
}

impl Options {
    /// Background threads for compactions and flushes. At least two, so
    /// compactions and flushes do not contend for a single thread.
    pub fn background_threads(&self) -> usize {
        self.num_cpu.max(2)
    }

    /// Concurrent subcompactions within a single compaction.
    pub fn subcompactions(&self) -> usize {
        (self.num_cpu / 2).max(1)
    }
}

/// An engine over one of the four backings. All engines share the common
/// operation set; operations a backing cannot serve return
/// [`crate::error::Error::Unsupported`].
pub enum Engine<E: Store> {
    /// Direct store access.
    Db { store: Arc<E> },
    /// An indexed write batch overlaying the store for reads.
    Batch { store: Arc<E>, batch: IndexedBatch },
    /// A write-only batch; buffers writes, serves no reads.
    WriteBatch { store: Arc<E>, batch: WriteBatch },
    /// A pinned read view of the store.
    Snapshot { store: Arc<E>, snapshot: E::Snapshot },
}

impl<E: Store> Engine<E> {
    /// Creates a direct engine over the given store.
    pub fn new(store: E) -> Self {
        Engine::Db { store: Arc::new(store) }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<E> {
        match self {
            Engine::Db { store }
            | Engine::Batch { store, .. }
            | Engine::WriteBatch { store, .. }
            | Engine::Snapshot { store, .. } => store,
        }
    }

    /// Creates a batch engine over the same store: indexed (readable) by
    /// default, write-only when requested.
    pub fn new_batch(&self, write_only: bool) -> Engine<E> {
        let store = self.store().clone();
        if write_only {
            Engine::WriteBatch { store, batch: WriteBatch::new() }
        } else {
            Engine::Batch { store, batch: IndexedBatch::new() }
        }
    }

    /// Creates a snapshot engine pinning the store's current state.
    pub fn new_snapshot(&self) -> Engine<E> {
        let store = self.store().clone();
        let snapshot = store.snapshot();
        Engine::Snapshot { store, snapshot }
    }

    /// Sets a value for an MVCC key.
    pub fn put(&mut self, key: &[u8], ts: Timestamp, value: &[u8]) -> Result<()> {
        let encoded = encode_key(key, ts);
        match self {
            Engine::Db { store } => store.put(&encoded, value),
            Engine::Batch { batch, .. } => {
                batch.put(encoded, value.to_vec());
                Ok(())
            }
            Engine::WriteBatch { batch, .. } => {
                batch.put(encoded, value.to_vec());
                Ok(())
            }
            Engine::Snapshot { .. } => errunsupported!("put on a snapshot"),
        }
    }

    /// Records a merge operand for an MVCC key.
    pub fn merge(&mut self, key: &[u8], ts: Timestamp, value: &[u8]) -> Result<()> {
        let encoded = encode_key(key, ts);
        match self {
            Engine::Db { store } => store.merge(&encoded, value),
            Engine::Batch { batch, .. } => {
                batch.merge(encoded, value.to_vec());
                Ok(())
            }
            Engine::WriteBatch { batch, .. } => {
                batch.merge(encoded, value.to_vec());
                Ok(())
            }
            Engine::Snapshot { .. } => errunsupported!("merge on a snapshot"),
        }
    }

    /// Deletes an MVCC key.
    pub fn delete(&mut self, key: &[u8], ts: Timestamp) -> Result<()> {
        let encoded = encode_key(key, ts);
        match self {
            Engine::Db { store } => store.delete(&encoded),
            Engine::Batch { batch, .. } => {
                batch.delete(encoded);
                Ok(())
            }
            Engine::WriteBatch { batch, .. } => {
                batch.delete(encoded);
                Ok(())
            }
            Engine::Snapshot { .. } => errunsupported!("delete on a snapshot"),
        }
    }

    /// Deletes the MVCC key range [start, end).
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        let start = encode_key(start, Timestamp::ZERO);
        let end = encode_key(end, Timestamp::ZERO);
        match self {
            Engine::Db { store } => store.delete_range(&start, &end),
            Engine::Batch { batch, .. } => {
                batch.delete_range(start, end);
                Ok(())
            }
            Engine::WriteBatch { batch, .. } => {
                batch.delete_range(start, end);
                Ok(())
            }
            Engine::Snapshot { .. } => errunsupported!("delete range on a snapshot"),
        }
    }

    /// Deletes every key in [start, end) that is visible through the given
    /// iterator, as individual point deletions.
    pub fn delete_iter_range<I: Iter>(
        &mut self,
        iter: &mut I,
        start: &[u8],
        end: &[u8],
    ) -> Result<()> {
        iter.seek(&encode_key(start, Timestamp::ZERO))?;
        let end_key = encode_key(end, Timestamp::ZERO);
        while iter.valid() && compare(iter.key(), &end_key) == Ordering::Less {
            let (key, ts) = decode_key(iter.key())?;
            let key = key.to_vec();
            self.delete(&key, ts)?;
            iter.next()?;
        }
        Ok(())
    }

    /// Gets the value of an MVCC key, if it exists. Batch engines replay
    /// their buffered operations for the key over the store's value.
    pub fn get(&self, key: &[u8], ts: Timestamp) -> Result<Option<Vec<u8>>> {
        let encoded = encode_key(key, ts);
        match self {
            Engine::Db { store } => store.get(&encoded),
            Engine::Batch { store, batch } => batch.get(&encoded, || store.get(&encoded)),
            Engine::WriteBatch { .. } => errunsupported!("get on a write-only batch"),
            Engine::Snapshot { snapshot, .. } => snapshot.get(&encoded),
        }
    }

    /// Opens an iterator over the engine's view. Batch engines return an
    /// overlay of the batch on the store.
    pub fn iter(&self, opts: IterOptions) -> Result<EngineIter<'_, E>> {
        match self {
            Engine::Db { store } => Ok(EngineIter::Base(store.iter(opts)?)),
            Engine::Batch { store, batch } => {
                if batch.has_delete_range() {
                    return errunsupported!(
                        "cannot iterate over a batch containing range deletions"
                    );
                }
                let prefix = opts.prefix_same_as_start;
                Ok(EngineIter::Overlay(OverlayIter::new(store.iter(opts)?, batch, prefix)))
            }
            Engine::WriteBatch { .. } => errunsupported!("iterate on a write-only batch"),
            Engine::Snapshot { snapshot, .. } => Ok(EngineIter::Base(snapshot.iter(opts)?)),
        }
    }

    /// Opens a time-bound iterator over [min, max], skipping tables whose
    /// recorded timestamp bounds are disjoint from the interval.
    pub fn time_bound_iter(
        &self,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<EngineIter<'_, E>> {
        self.iter(IterOptions::time_bounded(min, max))
    }

    /// Commits a batch engine's buffered writes to the store atomically.
    /// With sync, the commit is durable when this returns.
    pub fn commit(&mut self, sync: bool) -> Result<()> {
        match self {
            Engine::Db { .. } => errunsupported!("commit on a direct engine"),
            Engine::Batch { store, batch } => {
                if batch.count() == 0 {
                    return Ok(());
                }
                store.write(batch.write_batch(), sync)
            }
            Engine::WriteBatch { store, batch } => {
                if batch.count() == 0 {
                    return Ok(());
                }
                store.write(batch, sync)
            }
            Engine::Snapshot { .. } => errunsupported!("commit on a snapshot"),
        }
    }

    /// Applies a serialized batch representation: direct engines write it
    /// to the store, batch engines replay it into their buffer (without
    /// sync, which buffered replay cannot honor).
    pub fn apply_repr(&mut self, repr: &[u8], sync: bool) -> Result<usize> {
        match self {
            Engine::Db { store } => {
                let batch = WriteBatch::from_repr(repr)?;
                let count = batch.count();
                store.write(&batch, sync)?;
                Ok(count)
            }
            Engine::Batch { batch, .. } => {
                if sync {
                    return errunsupported!("synchronous apply on a batch");
                }
                batch.apply_repr(repr)
            }
            Engine::WriteBatch { batch, .. } => {
                if sync {
                    return errunsupported!("synchronous apply on a batch");
                }
                batch.apply_repr(repr)
            }
            Engine::Snapshot { .. } => errunsupported!("apply on a snapshot"),
        }
    }

    /// The serialized representation of a batch engine's buffered writes.
    pub fn repr(&self) -> Result<Vec<u8>> {
        match self {
            Engine::Db { .. } => errunsupported!("repr on a direct engine"),
            Engine::Batch { batch, .. } => batch.repr(),
            Engine::WriteBatch { batch, .. } => batch.repr(),
            Engine::Snapshot { .. } => errunsupported!("repr on a snapshot"),
        }
    }

    /// Writes a file into the store's environment. Only direct engines
    /// touch the environment.
    pub fn env_write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        match self {
            Engine::Db { store } => store.env_write_file(path, contents),
            _ => errunsupported!("environment writes on a derived engine"),
        }
    }

    /// Returns the store's operational statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        match self {
            Engine::Db { store } => store.stats(),
            _ => errunsupported!("stats on a derived engine"),
        }
    }

    /// Returns the store's compaction state summary.
    pub fn compaction_stats(&self) -> Result<String> {
        match self {
            Engine::Db { store } => store.compaction_stats(),
            _ => errunsupported!("compaction stats on a derived engine"),
        }
    }
}

/// An iterator over an engine's view: either the store's own iterator or a
/// batch overlay.
pub enum EngineIter<'a, E: Store> {
    Base(E::Iter),
    Overlay(OverlayIter<'a, E::Iter>),
}

impl<E: Store> Iter for EngineIter<'_, E> {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.seek(key),
            EngineIter::Overlay(iter) => iter.seek(key),
        }
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.seek_for_prev(key),
            EngineIter::Overlay(iter) => iter.seek_for_prev(key),
        }
    }

    fn seek_to_first(&mut self) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.seek_to_first(),
            EngineIter::Overlay(iter) => iter.seek_to_first(),
        }
    }

    fn seek_to_last(&mut self) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.seek_to_last(),
            EngineIter::Overlay(iter) => iter.seek_to_last(),
        }
    }

    fn next(&mut self) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.next(),
            EngineIter::Overlay(iter) => iter.next(),
        }
    }

    fn prev(&mut self) -> Result<()> {
        match self {
            EngineIter::Base(iter) => iter.prev(),
            EngineIter::Overlay(iter) => iter.prev(),
        }
    }

    fn valid(&self) -> bool {
        match self {
            EngineIter::Base(iter) => iter.valid(),
            EngineIter::Overlay(iter) => iter.valid(),
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            EngineIter::Base(iter) => iter.key(),
            EngineIter::Overlay(iter) => iter.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            EngineIter::Base(iter) => iter.value(),
            EngineIter::Overlay(iter) => iter.value(),
        }
    }
}
