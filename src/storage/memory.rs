//! An in-memory reference implementation of the [`Store`] trait, used by the
//! test suite and by embedders that want a non-durable store. Data lives in
//! a B-tree ordered by the MVCC comparator. The LSM shape is modeled just
//! enough to exercise the layers above: committed writes accumulate in a
//! memtable accounting record, flushes turn it into level-0 run metadata,
//! and compactions coalesce runs into the bottommost level. The run records
//! back table metadata, approximate sizes, and coarse time-bound filtering;
//! the authoritative data is always the B-tree.

use super::batch::{BatchOp, WriteBatch};
use super::db::{Options, WRITE_BUFFER_SIZE};
use super::engine::{Iter, IterOptions, Snapshot, SstMetadata, Store, StoreStats};
use super::merge::{MergeOperator, MvccMergeOperator};
use super::sst::SstFile;
use super::timebound::{TimeBoundCollector, TimeBounds};
use crate::encoding::mvcckey::{compare, key_prefix, SortKey};
use crate::encoding::Value as _;
use crate::error::Result;
use crate::hlc::Timestamp;

use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// The number of modeled LSM levels.
const NUM_LEVELS: usize = 7;

/// An in-memory store ordered by the MVCC comparator.
pub struct Memory {
    inner: RwLock<Inner>,
    merge_op: Arc<dyn MergeOperator>,
    block_cache_capacity: i64,
}

struct Inner {
    data: BTreeMap<SortKey, Vec<u8>>,
    runs: Vec<Run>,
    files: HashMap<String, Vec<u8>>,
    mem: Memtable,
    flushes: i64,
    compactions: i64,
}

/// Metadata for one flushed or ingested run.
#[derive(Clone, Debug)]
struct Run {
    level: usize,
    size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    bounds: TimeBounds,
}

/// Accounting for writes not yet represented by a run.
#[derive(Clone, Debug, Default)]
struct Memtable {
    bytes: u64,
    count: u64,
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
    collector: TimeBoundCollector,
}

impl Memtable {
    fn record(&mut self, key: &[u8], value_len: usize) {
        self.bytes += (key.len() + value_len) as u64;
        self.count += 1;
        self.collector.add(key);
        if self.smallest.as_deref().map_or(true, |s| compare(key, s) == Ordering::Less) {
            self.smallest = Some(key.to_vec());
        }
        if self.largest.as_deref().map_or(true, |l| compare(key, l) == Ordering::Greater) {
            self.largest = Some(key.to_vec());
        }
    }
}

impl Memory {
    /// Creates a store with default options.
    pub fn new() -> Self {
        Self::open(Options::default()).expect("default options are valid")
    }

    /// Opens a store with the given options. The MVCC merge operator is
    /// always installed.
    pub fn open(options: Options) -> Result<Self> {
        if !options.extra_options.is_empty() {
            return errinput!("extra options are not supported by this build");
        }
        if options.must_exist {
            return errinput!("in-memory store does not exist and must_exist is set");
        }
        let mut block_cache_capacity = 0;
        if let Some(cache) = &options.cache {
            // Reserve one memtable worth of memory from the shared cache.
            cache.reserve(WRITE_BUFFER_SIZE as i64);
            block_cache_capacity = cache.capacity();
        }
        if options.logging_enabled {
            info!(
                "opening memory store: {} background threads, {} subcompactions, \
                 block size {} bytes, wal ttl {}s",
                options.background_threads(),
                options.subcompactions(),
                options.block_size,
                options.wal_ttl_seconds,
            );
        }
        Ok(Self {
            inner: RwLock::new(Inner {
                data: BTreeMap::new(),
                runs: Vec::new(),
                files: HashMap::new(),
                mem: Memtable::default(),
                flushes: 0,
                compactions: 0,
            }),
            merge_op: Arc::new(MvccMergeOperator),
            block_cache_capacity,
        })
    }

    /// Applies a single operation to the locked state.
    fn apply(&self, inner: &mut Inner, op: &BatchOp) -> Result<()> {
        match op {
            BatchOp::Put(key, value) => {
                inner.mem.record(key, value.len());
                inner.data.insert(SortKey(key.clone()), value.clone());
            }
            BatchOp::Merge(key, operand) => {
                inner.mem.record(key, operand.len());
                let existing = inner.data.get(&SortKey(key.clone()));
                let merged = self.merge_op.full_merge(
                    key,
                    existing.map(|v| v.as_slice()),
                    std::slice::from_ref(operand),
                )?;
                inner.data.insert(SortKey(key.clone()), merged);
            }
            BatchOp::Delete(key) => {
                inner.mem.record(key, 0);
                inner.data.remove(&SortKey(key.clone()));
            }
            BatchOp::DeleteRange(start, end) => {
                inner.mem.record(start, 0);
                inner.mem.record(end, 0);
                let doomed: Vec<SortKey> = inner
                    .data
                    .range((Bound::Included(SortKey(start.clone())), Bound::Excluded(SortKey(end.clone()))))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    inner.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Flushes the locked memtable accounting into a level-0 run.
    fn flush_locked(inner: &mut Inner) {
        if inner.mem.count == 0 {
            return;
        }
        let mem = std::mem::take(&mut inner.mem);
        inner.runs.push(Run {
            level: 0,
            size: mem.bytes,
            smallest: mem.smallest.expect("nonempty memtable"),
            largest: mem.largest.expect("nonempty memtable"),
            bounds: mem.collector.finish(),
        });
        inner.flushes += 1;
    }

    /// Materializes the current entries as a sorted vector.
    fn entries(inner: &Inner) -> Vec<(Vec<u8>, Vec<u8>)> {
        inner.data.iter().map(|(k, v)| (k.0.clone(), v.clone())).collect()
    }

    /// Returns true if any run (or the memtable) may contain versions in the
    /// closed timestamp interval. Filtering is per table, so this admits
    /// supersets, matching the contract of time-bound iteration.
    fn may_contain_versions(inner: &Inner, min: Timestamp, max: Timestamp) -> bool {
        let mut any = inner.runs.iter().any(|run| run.bounds.overlaps(min, max));
        if inner.mem.count > 0 {
            any = any || inner.mem.collector.clone().finish().overlaps(min, max);
        }
        any
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Store for Memory {
    type Iter = MemIter;
    type Snapshot = MemSnapshot;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        self.apply(&mut inner, &BatchOp::Put(key.to_vec(), value.to_vec()))
    }

    fn merge(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        self.apply(&mut inner, &BatchOp::Merge(key.to_vec(), value.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        self.apply(&mut inner, &BatchOp::Delete(key.to_vec()))
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        self.apply(&mut inner, &BatchOp::DeleteRange(start.to_vec(), end.to_vec()))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read()?;
        Ok(inner.data.get(&SortKey(key.to_vec())).cloned())
    }

    fn iter(&self, opts: IterOptions) -> Result<MemIter> {
        let inner = self.inner.read()?;
        let entries = match opts.time_bounds {
            Some((min, max)) if !Self::may_contain_versions(&inner, min, max) => Vec::new(),
            _ => Self::entries(&inner),
        };
        Ok(MemIter::new(entries, opts.prefix_same_as_start))
    }

    fn snapshot(&self) -> MemSnapshot {
        let inner = self.inner.read().expect("lock poisoned");
        MemSnapshot {
            entries: Self::entries(&inner),
            run_bounds: inner.runs.iter().map(|run| run.bounds.clone()).collect(),
            mem_bounds: (inner.mem.count > 0).then(|| inner.mem.collector.clone().finish()),
        }
    }

    fn write(&self, batch: &WriteBatch, _sync: bool) -> Result<()> {
        // Durability is not modeled; the sync flag is accepted and ignored.
        let mut inner = self.inner.write()?;
        for op in batch.ops() {
            self.apply(&mut inner, op)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        Self::flush_locked(&mut inner);
        Ok(())
    }

    fn sst_metadata(&self) -> Result<Vec<SstMetadata>> {
        let inner = self.inner.read()?;
        inner
            .runs
            .iter()
            .map(|run| {
                Ok(SstMetadata {
                    level: run.level,
                    size: run.size,
                    smallest_key: run.smallest.clone(),
                    largest_key: run.largest.clone(),
                    ts_min: run.bounds.min_timestamp()?,
                    ts_max: run.bounds.max_timestamp()?,
                })
            })
            .collect()
    }

    fn num_levels(&self) -> usize {
        NUM_LEVELS
    }

    fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        _force_bottommost: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write()?;
        Self::flush_locked(&mut inner);

        let overlaps = |run: &Run| {
            !start.is_some_and(|s| compare(&run.largest, s) == Ordering::Less)
                && !end.is_some_and(|e| compare(&run.smallest, e) != Ordering::Less)
        };
        let (compacted, kept): (Vec<Run>, Vec<Run>) =
            inner.runs.drain(..).partition(|run| overlaps(run));
        inner.runs = kept;
        if compacted.is_empty() {
            return Ok(());
        }

        let mut merged = compacted[0].clone();
        merged.level = NUM_LEVELS - 1;
        for run in &compacted[1..] {
            merged.size += run.size;
            if compare(&run.smallest, &merged.smallest) == Ordering::Less {
                merged.smallest = run.smallest.clone();
            }
            if compare(&run.largest, &merged.largest) == Ordering::Greater {
                merged.largest = run.largest.clone();
            }
            merged.bounds.union(&run.bounds);
        }
        debug!(
            "compacted {} runs into level {} ({} bytes)",
            compacted.len(),
            merged.level,
            merged.size
        );
        inner.runs.push(merged);
        inner.compactions += 1;
        Ok(())
    }

    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64> {
        let inner = self.inner.read()?;
        let size = inner
            .data
            .range((
                Bound::Included(SortKey(start.to_vec())),
                Bound::Excluded(SortKey(end.to_vec())),
            ))
            .map(|(k, v)| (k.0.len() + v.len()) as u64)
            .sum();
        Ok(size)
    }

    fn env_write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn env_read_file(&self, path: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read()?;
        inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| crate::error::Error::IO(format!("no such file: {path}")))
    }

    fn ingest_file(&self, path: &str, move_file: bool) -> Result<()> {
        let mut inner = self.inner.write()?;
        let contents = inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| crate::error::Error::IO(format!("no such file: {path}")))?;
        let file = SstFile::decode(&contents)?;
        if file.entries.is_empty() {
            return errinput!("cannot ingest an empty sst run");
        }
        let smallest = file.entries.first().expect("nonempty").0.clone();
        let largest = file.entries.last().expect("nonempty").0.clone();
        let size = contents.len() as u64;
        for (key, value) in file.entries {
            inner.data.insert(SortKey(key), value);
        }
        inner.runs.push(Run { level: 0, size, smallest, largest, bounds: file.bounds });
        if move_file {
            inner.files.remove(path);
        }
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.read()?;
        Ok(StoreStats {
            memtable_total_size: inner.mem.bytes,
            flushes: inner.flushes,
            compactions: inner.compactions,
            block_cache_capacity: self.block_cache_capacity,
        })
    }

    fn compaction_stats(&self) -> Result<String> {
        let inner = self.inner.read()?;
        let mut out = format!("memtable: {} entries, {} bytes\n", inner.mem.count, inner.mem.bytes);
        for level in 0..NUM_LEVELS {
            let (count, size) = inner
                .runs
                .iter()
                .filter(|run| run.level == level)
                .fold((0, 0), |(count, size), run| (count + 1, size + run.size));
            if count > 0 {
                out.push_str(&format!("L{level}: {count} runs, {size} bytes\n"));
            }
        }
        Ok(out)
    }
}

/// An iterator over a materialized point-in-time copy of the store.
pub struct MemIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    cursor: Option<usize>,
    prefix_mode: bool,
    prefix: Option<Vec<u8>>,
}

impl MemIter {
    fn new(entries: Vec<(Vec<u8>, Vec<u8>)>, prefix_mode: bool) -> Self {
        Self { entries, cursor: None, prefix_mode, prefix: None }
    }

    /// The index of the first entry at or after the given key.
    fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| compare(k, key) == Ordering::Less)
    }

    fn set_prefix(&mut self, key: &[u8]) {
        if self.prefix_mode {
            self.prefix = Some(key_prefix(key).to_vec());
        }
    }

    fn set_prefix_from_position(&mut self) {
        if self.prefix_mode {
            self.prefix = self.cursor.map(|i| key_prefix(&self.entries[i].0).to_vec());
        }
    }
}

impl Iter for MemIter {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.set_prefix(key);
        let i = self.lower_bound(key);
        self.cursor = (i < self.entries.len()).then_some(i);
        Ok(())
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        self.set_prefix(key);
        self.cursor = self.lower_bound(key).checked_sub(1);
        Ok(())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.cursor = (!self.entries.is_empty()).then_some(0);
        self.set_prefix_from_position();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.cursor = self.entries.len().checked_sub(1);
        self.set_prefix_from_position();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(i) = self.cursor {
            self.cursor = (i + 1 < self.entries.len()).then_some(i + 1);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if let Some(i) = self.cursor {
            self.cursor = i.checked_sub(1);
        }
        Ok(())
    }

    fn valid(&self) -> bool {
        let Some(i) = self.cursor else {
            return false;
        };
        match &self.prefix {
            Some(prefix) => key_prefix(&self.entries[i].0) == prefix.as_slice(),
            None => true,
        }
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.cursor.expect("iterator is not valid")].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.cursor.expect("iterator is not valid")].1
    }
}

/// A point-in-time snapshot: a full copy of the entries plus the table
/// bounds needed for time-bound iteration.
pub struct MemSnapshot {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    run_bounds: Vec<TimeBounds>,
    mem_bounds: Option<TimeBounds>,
}

impl Snapshot for MemSnapshot {
    type Iter = MemIter;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let i = self.entries.partition_point(|(k, _)| compare(k, key) == Ordering::Less);
        Ok(self
            .entries
            .get(i)
            .filter(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.clone()))
    }

    fn iter(&self, opts: IterOptions) -> Result<MemIter> {
        if let Some((min, max)) = opts.time_bounds {
            let mut any = self.run_bounds.iter().any(|bounds| bounds.overlaps(min, max));
            if let Some(mem_bounds) = &self.mem_bounds {
                any = any || mem_bounds.overlaps(min, max);
            }
            if !any {
                return Ok(MemIter::new(Vec::new(), opts.prefix_same_as_start));
            }
        }
        Ok(MemIter::new(self.entries.clone(), opts.prefix_same_as_start))
    }
}
