//! The overlay iterator: a forward-only merged view of a base iterator and
//! an indexed write batch, providing read-your-writes iteration over an
//! uncommitted batch. Batched puts shadow base entries, batched deletions
//! hide them, and batched merge records are replayed against the base value
//! to produce the merged result on the fly.
//!
//! Reverse iteration is not supported: batched merge replay only works
//! forward, and no caller needs reverse iteration over an uncommitted batch.

use super::batch::IndexedBatch;
use super::engine::Iter;
use crate::encoding::mvcckey::{compare, key_prefix, SortKey};
use crate::error::Result;

use std::cmp::Ordering;
use std::ops::Bound;

/// A merged forward iterator over a base iterator and an indexed batch.
pub struct OverlayIter<'a, I: Iter> {
    base: I,
    batch: &'a IndexedBatch,
    /// The batch key the delta cursor is positioned at, if any.
    delta_pos: Option<SortKey>,
    /// True if the current entry comes from the base iterator, false if it
    /// comes from the batch. When the base is exhausted this stays true to
    /// mark the whole iterator invalid.
    current_at_base: bool,
    /// True if the base and delta are positioned at the same key, in which
    /// case both advance together.
    equal_keys: bool,
    /// The replayed value for the current delta key. None while positioned
    /// at the base.
    merged: Option<Vec<u8>>,
    /// A copy of the current delta key. Kept owned so `key` can return it
    /// without borrowing the batch index.
    delta_key: Vec<u8>,
    /// Restrict iteration to the user-key prefix of the seeked key.
    prefix_same_as_start: bool,
    /// The active prefix bound, if prefix iteration is enabled.
    prefix_start: Option<Vec<u8>>,
}

impl<'a, I: Iter> OverlayIter<'a, I> {
    /// Creates an overlay of the batch over the base iterator. Callers must
    /// reject batches containing range deletions before constructing one.
    pub fn new(base: I, batch: &'a IndexedBatch, prefix_same_as_start: bool) -> Self {
        Self {
            base,
            batch,
            delta_pos: None,
            current_at_base: true,
            equal_keys: false,
            merged: None,
            delta_key: Vec::new(),
            prefix_same_as_start,
            prefix_start: None,
        }
    }

    /// Positions the delta cursor at the first batch key at or after the
    /// given key.
    fn delta_seek(&mut self, key: &[u8]) {
        self.delta_pos = self
            .batch
            .index()
            .range((Bound::Included(SortKey(key.to_vec())), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone());
    }

    /// Positions the delta cursor at the first batch key.
    fn delta_seek_to_first(&mut self) {
        self.delta_pos = self.batch.index().keys().next().cloned();
    }

    /// Positions the delta cursor at the last batch key.
    fn delta_seek_to_last(&mut self) {
        self.delta_pos = self.batch.index().keys().next_back().cloned();
    }

    /// Advances the delta cursor past its current key, clearing any replayed
    /// value.
    fn advance_delta(&mut self) {
        self.merged = None;
        if let Some(pos) = self.delta_pos.take() {
            self.delta_pos = self
                .batch
                .index()
                .range((Bound::Excluded(pos), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone());
        }
    }

    fn delta_valid(&self) -> bool {
        self.delta_pos.is_some()
    }

    /// Replays the batch operations for the current delta key, merging with
    /// the base value when both sides are positioned at the same key.
    /// Returns true if the replayed result is a deletion.
    fn process_delta(&mut self) -> Result<bool> {
        let pos = self.delta_pos.clone().expect("delta is valid");
        self.delta_key = pos.0.clone();
        let positions = self.batch.index().get(&pos).expect("cursor points into index");
        let base_value = self.equal_keys.then(|| self.base.value().to_vec());
        self.merged = self.batch.replay(positions, move || Ok(base_value))?;
        Ok(self.merged.is_none())
    }

    /// Checks whether the given encoded key falls outside the active prefix.
    fn outside_prefix(&self, key: &[u8]) -> bool {
        self.prefix_start.as_deref().is_some_and(|prefix| key_prefix(key) != prefix)
    }

    /// Re-derives the current entry after a seek or advance, consuming
    /// batched deletions. This is the workhorse: it decides which side the
    /// iterator reports, replaying batch operations as needed.
    fn update_current(&mut self, check_prefix: bool) -> Result<()> {
        self.merged = None;
        loop {
            self.equal_keys = false;
            if !self.base.valid() {
                // Base is exhausted; only the delta can contribute.
                if !self.delta_valid() {
                    self.current_at_base = true;
                    return Ok(());
                }
                let delta_key = self.delta_pos.as_ref().expect("valid").0.clone();
                if check_prefix && self.outside_prefix(&delta_key) {
                    // The delta moved past the iteration prefix. Pointing at
                    // the exhausted base marks the iterator invalid.
                    self.current_at_base = true;
                    return Ok(());
                }
                if !self.process_delta()? {
                    self.current_at_base = false;
                    return Ok(());
                }
                // The delta entry is a deletion.
                self.advance_delta();
                continue;
            }

            if !self.delta_valid() {
                self.current_at_base = true;
                return Ok(());
            }

            // Both sides are valid; compare keys to pick one.
            let delta_key = self.delta_pos.as_ref().expect("valid").0.clone();
            match compare(&delta_key, self.base.key()) {
                Ordering::Greater => {
                    self.current_at_base = true;
                    return Ok(());
                }
                ordering => {
                    if ordering == Ordering::Equal {
                        self.equal_keys = true;
                    }
                    if !self.process_delta()? {
                        self.current_at_base = false;
                        return Ok(());
                    }
                    // The delta entry is a deletion; skip it, and the shadowed
                    // base entry with it.
                    self.advance_delta();
                    if self.equal_keys {
                        self.base.next()?;
                    }
                }
            }
        }
    }

    /// Saves the prefix bound from the current position, for entry points
    /// that do not seek to an explicit key.
    fn save_prefix_from_position(&mut self) {
        if self.prefix_same_as_start {
            self.prefix_start = self.valid().then(|| key_prefix(self.key()).to_vec());
        }
    }
}

impl<I: Iter> Iter for OverlayIter<'_, I> {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        if self.prefix_same_as_start {
            self.prefix_start = Some(key_prefix(key).to_vec());
        }
        self.base.seek(key)?;
        self.delta_seek(key);
        self.update_current(self.prefix_same_as_start)?;
        if self.prefix_same_as_start && !self.valid() {
            self.prefix_start = None;
        }
        Ok(())
    }

    fn seek_for_prev(&mut self, _key: &[u8]) -> Result<()> {
        errunsupported!("reverse iteration on a batch overlay")
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.base.seek_to_first()?;
        self.delta_seek_to_first();
        self.update_current(false)?;
        self.save_prefix_from_position();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.prefix_start = None;
        self.base.seek_to_last()?;
        self.delta_seek_to_last();
        self.update_current(false)?;
        self.save_prefix_from_position();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return errunsupported!("next on an invalid iterator");
        }
        if self.equal_keys {
            self.base.next()?;
            self.advance_delta();
        } else if self.current_at_base {
            self.base.next()?;
        } else {
            self.advance_delta();
        }
        self.update_current(self.prefix_same_as_start)
    }

    fn prev(&mut self) -> Result<()> {
        errunsupported!("reverse iteration on a batch overlay")
    }

    fn valid(&self) -> bool {
        if self.current_at_base {
            self.base.valid()
        } else {
            self.delta_valid()
        }
    }

    fn key(&self) -> &[u8] {
        if self.current_at_base {
            self.base.key()
        } else {
            &self.delta_key
        }
    }

    fn value(&self) -> &[u8] {
        if self.current_at_base {
            self.base.value()
        } else {
            self.merged.as_deref().expect("delta entry has a replayed value")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::mvcckey::encode_key;
    use crate::encoding::Value as _;
    use crate::error::Error;
    use crate::hlc::Timestamp;
    use crate::storage::engine::{IterOptions, Store as _};
    use crate::storage::memory::Memory;
    use crate::storage::mvcc::{make_value, value_payload, MVCCMetadata, TAG_BYTES};

    use pretty_assertions::assert_eq;

    fn key(k: &[u8], wall: i64) -> Vec<u8> {
        encode_key(k, Timestamp::new(wall, 0))
    }

    fn operand(payload: &[u8]) -> Vec<u8> {
        MVCCMetadata { raw_bytes: Some(make_value(TAG_BYTES, payload)), ..Default::default() }
            .encode()
            .unwrap()
    }

    /// Collects all (key, value) pairs from an overlay via seek_to_first.
    fn collect<I: Iter>(iter: &mut OverlayIter<'_, I>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        iter.seek_to_first()?;
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next()?;
        }
        Ok(out)
    }

    fn base_store() -> Result<Memory> {
        let store = Memory::new();
        store.put(&key(b"b", 1), b"b1")?;
        store.put(&key(b"d", 1), b"d1")?;
        store.put(&key(b"f", 1), b"f1")?;
        Ok(store)
    }

    #[test]
    fn merges_puts_and_base() -> Result<()> {
        let store = base_store()?;
        let mut batch = IndexedBatch::new();
        batch.put(key(b"a", 1), b"a-batch".to_vec()); // before base
        batch.put(key(b"d", 1), b"d-batch".to_vec()); // shadows base
        batch.put(key(b"g", 1), b"g-batch".to_vec()); // after base

        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        assert_eq!(
            collect(&mut iter)?,
            vec![
                (key(b"a", 1), b"a-batch".to_vec()),
                (key(b"b", 1), b"b1".to_vec()),
                (key(b"d", 1), b"d-batch".to_vec()),
                (key(b"f", 1), b"f1".to_vec()),
                (key(b"g", 1), b"g-batch".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn deletions_hide_base_entries() -> Result<()> {
        let store = base_store()?;
        let mut batch = IndexedBatch::new();
        batch.delete(key(b"b", 1)); // hides base entry
        batch.delete(key(b"c", 1)); // no base entry; invisible
        batch.put(key(b"e", 1), b"e-batch".to_vec());
        batch.delete(key(b"e", 1)); // deletes own put

        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        assert_eq!(
            collect(&mut iter)?,
            vec![(key(b"d", 1), b"d1".to_vec()), (key(b"f", 1), b"f1".to_vec())]
        );
        Ok(())
    }

    #[test]
    fn merge_records_replay_against_base() -> Result<()> {
        let store = Memory::new();
        let meta_key = encode_key(b"k", Timestamp::ZERO);
        store.put(&meta_key, &operand(b"hello"))?;

        let mut batch = IndexedBatch::new();
        batch.merge(meta_key.clone(), operand(b" world"));

        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        let entries = collect(&mut iter)?;
        assert_eq!(entries.len(), 1);
        let meta = MVCCMetadata::decode(&entries[0].1)?;
        assert_eq!(meta.raw_bytes, Some(make_value(TAG_BYTES, b"hello world")));
        Ok(())
    }

    #[test]
    fn merge_records_without_base_stand_alone() -> Result<()> {
        let store = Memory::new();
        let mut batch = IndexedBatch::new();
        let meta_key = encode_key(b"k", Timestamp::ZERO);
        batch.merge(meta_key.clone(), operand(b"solo"));
        batch.merge(meta_key.clone(), operand(b"-run"));

        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        let entries = collect(&mut iter)?;
        assert_eq!(entries.len(), 1);
        let meta = MVCCMetadata::decode(&entries[0].1)?;
        assert_eq!(value_payload(&meta.raw_bytes.unwrap()), b"solo-run");
        Ok(())
    }

    #[test]
    fn seek_positions_overlay() -> Result<()> {
        let store = base_store()?;
        let mut batch = IndexedBatch::new();
        batch.put(key(b"c", 1), b"c-batch".to_vec());

        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        iter.seek(&key(b"c", 1))?;
        assert!(iter.valid());
        assert_eq!(iter.value(), b"c-batch");
        iter.next()?;
        assert_eq!(iter.value(), b"d1");
        Ok(())
    }

    #[test]
    fn prefix_iteration_stops_at_boundary() -> Result<()> {
        let store = Memory::new();
        store.put(&key(b"a", 2), b"a2")?;
        store.put(&key(b"b", 1), b"b1")?;
        let mut batch = IndexedBatch::new();
        batch.put(key(b"a", 3), b"a3-batch".to_vec());
        batch.put(key(b"b", 2), b"b2-batch".to_vec());

        let base = store.iter(IterOptions::prefix())?;
        let mut iter = OverlayIter::new(base, &batch, true);
        iter.seek(&key(b"a", 3))?;
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.value().to_vec());
            iter.next()?;
        }
        assert_eq!(seen, vec![b"a3-batch".to_vec(), b"a2".to_vec()]);
        Ok(())
    }

    #[test]
    fn prefix_bounds_delta_only_keys() -> Result<()> {
        // The prefix check must also apply when the base is exhausted and
        // only batch keys remain.
        let store = Memory::new();
        store.put(&key(b"a", 1), b"a1")?;
        let mut batch = IndexedBatch::new();
        batch.put(key(b"b", 1), b"b-batch".to_vec());

        let base = store.iter(IterOptions::prefix())?;
        let mut iter = OverlayIter::new(base, &batch, true);
        iter.seek(&key(b"a", 1))?;
        assert!(iter.valid());
        assert_eq!(iter.value(), b"a1");
        iter.next()?;
        assert!(!iter.valid());
        Ok(())
    }

    #[test]
    fn reverse_is_unsupported() -> Result<()> {
        let store = base_store()?;
        let batch = IndexedBatch::new();
        let base = store.iter(IterOptions::default())?;
        let mut iter = OverlayIter::new(base, &batch, false);
        iter.seek_to_first()?;
        assert!(matches!(iter.prev(), Err(Error::Unsupported(_))));
        assert!(matches!(iter.seek_for_prev(&key(b"b", 1)), Err(Error::Unsupported(_))));
        Ok(())
    }
}
