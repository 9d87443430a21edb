//! Write batches. A [`WriteBatch`] is an ordered list of operations applied
//! atomically by the store; its serialized representation is the wire format
//! used to ship writes between nodes. An [`IndexedBatch`] additionally keeps
//! a comparator-ordered index over the batched keys so that reads and
//! iterators can overlay the batch on a base view before it commits
//! (read-your-writes).

use super::merge::merge_one;
use crate::encoding::mvcckey::SortKey;
use crate::encoding::{self, Value as _};
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single batched operation. Keys are encoded MVCC sort keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Set a key to a value.
    Put(
        #[serde(with = "serde_bytes")] Vec<u8>,
        #[serde(with = "serde_bytes")] Vec<u8>,
    ),
    /// Record a merge operand for a key.
    Merge(
        #[serde(with = "serde_bytes")] Vec<u8>,
        #[serde(with = "serde_bytes")] Vec<u8>,
    ),
    /// Delete a key.
    Delete(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Delete the key range [start, end).
    DeleteRange(
        #[serde(with = "serde_bytes")] Vec<u8>,
        #[serde(with = "serde_bytes")] Vec<u8>,
    ),
}

/// An ordered set of write operations, applied atomically on commit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl encoding::Value for WriteBatch {}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Appends a merge.
    pub fn merge(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Merge(key, value));
    }

    /// Appends a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Appends a range deletion of [start, end).
    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(BatchOp::DeleteRange(start, end));
    }

    /// The number of operations in the batch.
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The batched operations, in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Serializes the batch for shipping or replay.
    pub fn repr(&self) -> Result<Vec<u8>> {
        self.encode()
    }

    /// Deserializes a batch representation.
    pub fn from_repr(repr: &[u8]) -> Result<Self> {
        Self::decode(repr)
    }

    /// Replays a serialized batch into this one, returning the number of
    /// operations replayed.
    pub fn apply_repr(&mut self, repr: &[u8]) -> Result<usize> {
        let other = Self::from_repr(repr)?;
        let count = other.count();
        self.ops.extend(other.ops);
        Ok(count)
    }
}

/// A write batch with a read index. The index maps each batched key to the
/// positions of its operations, in insertion order, so the batch can be
/// overlaid on a base view: lookups replay the per-key operations on top of
/// the base value, and iterators walk the index in comparator order.
///
/// Range deletions are accepted into the batch but cannot be overlaid;
/// reads and iterators on a batch containing one are rejected.
#[derive(Clone, Debug, Default)]
pub struct IndexedBatch {
    batch: WriteBatch,
    index: BTreeMap<SortKey, Vec<usize>>,
    has_delete_range: bool,
}

impl IndexedBatch {
    /// Creates an empty indexed batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.index_op(key.clone());
        self.batch.put(key, value);
    }

    /// Appends a merge.
    pub fn merge(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.index_op(key.clone());
        self.batch.merge(key, value);
    }

    /// Appends a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.index_op(key.clone());
        self.batch.delete(key);
    }

    /// Appends a range deletion. The batch can still be committed, but can
    /// no longer serve reads or iterators.
    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.has_delete_range = true;
        self.batch.delete_range(start, end);
    }

    fn index_op(&mut self, key: Vec<u8>) {
        let pos = self.batch.count();
        self.index.entry(SortKey(key)).or_default().push(pos);
    }

    /// The number of operations in the batch.
    pub fn count(&self) -> usize {
        self.batch.count()
    }

    /// Returns true if the batch contains a range deletion, which precludes
    /// reads and iteration.
    pub fn has_delete_range(&self) -> bool {
        self.has_delete_range
    }

    /// The underlying write batch, e.g. for committing.
    pub fn write_batch(&self) -> &WriteBatch {
        &self.batch
    }

    /// The key index: encoded key to operation positions in insertion order.
    pub(super) fn index(&self) -> &BTreeMap<SortKey, Vec<usize>> {
        &self.index
    }

    /// Serializes the underlying batch.
    pub fn repr(&self) -> Result<Vec<u8>> {
        self.batch.repr()
    }

    /// Replays a serialized batch into this one, indexing its operations.
    /// Returns the number of operations replayed.
    pub fn apply_repr(&mut self, repr: &[u8]) -> Result<usize> {
        let other = WriteBatch::from_repr(repr)?;
        let count = other.count();
        for op in other.ops {
            match op {
                BatchOp::Put(key, value) => self.put(key, value),
                BatchOp::Merge(key, value) => self.merge(key, value),
                BatchOp::Delete(key) => self.delete(key),
                BatchOp::DeleteRange(start, end) => self.delete_range(start, end),
            }
        }
        Ok(count)
    }

    /// Reads a key through the batch: replays the key's batched operations
    /// on top of the base value. `base` fetches the base value and is called
    /// at most once, and only if needed. Fails if the batch contains a range
    /// deletion.
    pub fn get(
        &self,
        key: &[u8],
        base: impl FnOnce() -> Result<Option<Vec<u8>>>,
    ) -> Result<Option<Vec<u8>>> {
        if self.batch.is_empty() {
            return base();
        }
        if self.has_delete_range {
            return errunsupported!("cannot read from a batch containing range deletions");
        }
        match self.index.get(&SortKey(key.to_vec())) {
            None => base(),
            Some(positions) => self.replay(positions, base),
        }
    }

    /// Replays the operations at the given positions, in order, over a base
    /// value. Returns None if the final state is a deletion.
    pub(super) fn replay(
        &self,
        positions: &[usize],
        base: impl FnOnce() -> Result<Option<Vec<u8>>>,
    ) -> Result<Option<Vec<u8>>> {
        let mut base = Some(base);
        let mut acc: Option<Vec<u8>> = None;
        let mut first = true;
        for &pos in positions {
            match &self.batch.ops()[pos] {
                BatchOp::Put(_, value) => acc = Some(value.clone()),
                BatchOp::Delete(_) => acc = None,
                BatchOp::Merge(_, operand) => {
                    // The first operation for the key merges with the base
                    // value; later ones merge with the accumulator.
                    let existing =
                        if first { base.take().expect("first use")()? } else { acc.take() };
                    acc = Some(match existing {
                        Some(existing) => merge_one(&existing, operand)?,
                        None => operand.clone(),
                    });
                }
                BatchOp::DeleteRange(..) => {
                    return errunsupported!("cannot replay a range deletion");
                }
            }
            first = false;
        }
        Ok(acc)
    }
}
