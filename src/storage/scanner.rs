//! The MVCC scanner: point gets and range scans over the versioned keyspace.
//!
//! The data is sorted by user key and descending timestamp, with a
//! timestampless metadata row first when a key has an intent or an inline
//! value:
//!
//! ```text
//! a @ t3
//! a @ t2
//! a @ t1
//! b <intent @ t2>
//! b @ t2
//! ```
//!
//! Scanning at a timestamp means finding, for each user key, the newest
//! version at or below the read timestamp, while honoring intents: an intent
//! above the read timestamp is invisible; an intent at or below it blocks
//! consistent reads (and is reported to the caller for resolution), while
//! inconsistent reads return the newest committed version below the intent.
//! A transaction reads its own intent's provisional value, except when the
//! intent is from another epoch of itself. Readers with an uncertainty
//! window fail with an uncertainty error when they observe a committed
//! version inside it, forcing the transaction to restart at a higher
//! timestamp.
//!
//! The scanner is careful about iterator movement cost. Finding the next
//! user key (or a particular version) first steps the iterator linearly up
//! to an adaptive budget, then falls back to a seek. The budget grows every
//! time stepping succeeds and shrinks every time the scanner had to seek,
//! staying within [1, MAX_ITERS_BEFORE_SEEK].
//!
//! Reverse scans walk user keys backwards while still reading each key's
//! versions forward. Doing this without extra seeks requires peeking one
//! entry backward to detect key boundaries. The scanner keeps owned copies
//! of the current key and value, so peeking moves the underlying iterator
//! while the copies keep serving the current entry; any other iterator
//! movement first cancels the peek.

use super::engine::Iter;
use super::mvcc::{Intent, MVCCMetadata, TxnMeta};
use crate::encoding::mvcckey::{decode_key, encode_key, split_key};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;

/// The maximum number of linear iterator steps to try before seeking.
const MAX_ITERS_BEFORE_SEEK: usize = 10;

/// The result of a scan: the visible key/value pairs in scan order, and any
/// intents encountered. For consistent scans the intents surface as a
/// [`Error::WriteIntent`] instead; for inconsistent scans they accompany the
/// data so the caller can resolve them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResult {
    /// The visible (user key, value) pairs, ascending for forward scans and
    /// descending for reverse scans. At most `max_keys + 1` rows: the extra
    /// row signals that the scan did not exhaust the range and names the
    /// resume key.
    pub kvs: Vec<(Vec<u8>, Vec<u8>)>,
    /// Intents encountered by an inconsistent scan.
    pub intents: Vec<Intent>,
}

/// Scans [start, end) at the given timestamp, returning at most
/// `max_keys + 1` rows (the extra row carries resume semantics; `max_keys`
/// of zero returns at most one row). With a transaction, the scan returns
/// the transaction's own provisional writes and checks its uncertainty
/// window. A consistent scan fails with [`Error::WriteIntent`] when it
/// encounters foreign intents at or below the read timestamp, collecting all
/// of them in one pass; an inconsistent scan returns them alongside the
/// data. Reverse scans return the same rows in descending key order.
#[allow(clippy::too_many_arguments)]
pub fn scan<I: Iter>(
    iter: &mut I,
    start: &[u8],
    end: &[u8],
    timestamp: Timestamp,
    max_keys: u64,
    txn: Option<&TxnMeta>,
    consistent: bool,
    reverse: bool,
) -> Result<ScanResult> {
    // A reverse scan begins at the range's upper bound and walks down to
    // the lower bound, so the bounds swap roles.
    let (scan_from, scan_until) = if reverse { (end, start) } else { (start, end) };
    let mut scanner = Scanner::new(iter, scan_from, scan_until, timestamp, max_keys, txn, consistent, reverse);
    scanner.run_scan()?;
    scanner.finish()
}

/// Reads a single key at the given timestamp. Returns the visible value, if
/// any, and the key's intent when one was encountered by an inconsistent
/// read. A consistent read of a key with a foreign intent at or below the
/// read timestamp fails with [`Error::WriteIntent`].
pub fn get<I: Iter>(
    iter: &mut I,
    key: &[u8],
    timestamp: Timestamp,
    txn: Option<&TxnMeta>,
    consistent: bool,
) -> Result<(Option<Vec<u8>>, Option<Intent>)> {
    // A get is a forward scan capped at one row, with an empty end key that
    // stops iteration immediately after the first user key.
    let mut scanner = Scanner::new(iter, key, &[], timestamp, 0, txn, consistent, false);
    scanner.run_get()?;
    let ScanResult { kvs, mut intents } = scanner.finish()?;
    Ok((kvs.into_iter().next().map(|(_, v)| v), intents.pop()))
}

struct Scanner<'a, I: Iter> {
    iter: &'a mut I,
    /// The key the scan starts from: the lower bound forward, the upper
    /// bound in reverse.
    start_key: Vec<u8>,
    /// The key the scan stops at: the exclusive upper bound forward, the
    /// inclusive lower bound in reverse.
    end_key: Vec<u8>,
    timestamp: Timestamp,
    max_keys: u64,
    txn: Option<TxnMeta>,
    consistent: bool,
    reverse: bool,
    check_uncertainty: bool,
    kvs: Vec<(Vec<u8>, Vec<u8>)>,
    intents: Vec<Intent>,
    /// True if the underlying iterator has been moved one entry back to
    /// peek, while the cur_* copies still hold the scanner's current entry.
    peeked: bool,
    iters_before_seek: usize,
    /// Owned copies of the current entry. The iterator's own key/value
    /// memory does not survive movement, and peeking moves the iterator.
    cur_key: Vec<u8>,
    cur_ts: Timestamp,
    cur_value: Vec<u8>,
    /// Scratch for key comparisons across iterator movement.
    key_buf: Vec<u8>,
}

impl<'a, I: Iter> Scanner<'a, I> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        iter: &'a mut I,
        start_key: &[u8],
        end_key: &[u8],
        timestamp: Timestamp,
        max_keys: u64,
        txn: Option<&TxnMeta>,
        consistent: bool,
        reverse: bool,
    ) -> Self {
        let check_uncertainty = txn.is_some_and(|txn| timestamp < txn.max_timestamp);
        Self {
            iter,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            timestamp,
            max_keys,
            txn: txn.cloned(),
            consistent,
            reverse,
            check_uncertainty,
            kvs: Vec::new(),
            intents: Vec::new(),
            peeked: false,
            iters_before_seek: MAX_ITERS_BEFORE_SEEK / 2,
            cur_key: Vec::new(),
            cur_ts: Timestamp::ZERO,
            cur_value: Vec::new(),
            key_buf: Vec::new(),
        }
    }

    /// Runs a range scan.
    fn run_scan(&mut self) -> Result<()> {
        let seek_key = encode_key(&self.start_key, Timestamp::ZERO);
        if self.reverse {
            if !self.iter_seek_reverse(&seek_key)? {
                return Ok(());
            }
            while self.cur_key >= self.end_key {
                if !self.get_and_advance()? {
                    break;
                }
            }
        } else {
            if !self.iter_seek(&seek_key)? {
                return Ok(());
            }
            while self.cur_key < self.end_key {
                if !self.get_and_advance()? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Runs a point get: a single visit of the start key.
    fn run_get(&mut self) -> Result<()> {
        if !self.iter_seek(&encode_key(&self.start_key, Timestamp::ZERO))? {
            return Ok(());
        }
        if self.cur_key == self.start_key {
            self.get_and_advance()?;
        }
        Ok(())
    }

    /// Finishes the scan. Consistent scans with collected intents fail so
    /// the caller resolves them; the full intent set is in the error.
    fn finish(self) -> Result<ScanResult> {
        if self.consistent && !self.intents.is_empty() {
            return Err(Error::WriteIntent(self.intents));
        }
        Ok(ScanResult { kvs: self.kvs, intents: self.intents })
    }

    /// Processes the entry at the current position and advances to the next
    /// user key. Returns false when the scan should stop.
    fn get_and_advance(&mut self) -> Result<bool> {
        if !self.cur_ts.is_zero() {
            // A version row.
            if self.timestamp >= self.cur_ts {
                // 1. No intent, and the newest version is at or below our
                // read timestamp: emit it.
                let value = self.cur_value.clone();
                return self.add_and_advance(value);
            }

            if self.check_uncertainty {
                // 2. The newest version is above our read timestamp but
                // possibly inside our uncertainty window.
                let max_timestamp = self.txn.as_ref().expect("uncertainty implies txn").max_timestamp;
                if max_timestamp >= self.cur_ts {
                    return Err(Error::Uncertainty(self.cur_ts));
                }
                // Let seek_version surface any version above the window's
                // top as an uncertainty error.
                return self.seek_version(max_timestamp, true);
            }

            // 3. The newest version is above our read timestamp and
            // uncertainty is impossible: find the newest version at or
            // below it.
            let timestamp = self.timestamp;
            return self.seek_version(timestamp, false);
        }

        // A metadata row.
        let meta = MVCCMetadata::decode(&self.cur_value)
            .map_err(|err| Error::Corruption(format!("unable to decode mvcc metadata: {err}")))?;

        if let Some(raw_bytes) = &meta.raw_bytes {
            // 4. An inline value: emit it regardless of timestamp.
            let value = raw_bytes.clone();
            return self.add_and_advance(value);
        }

        let Some(meta_txn) = &meta.txn else {
            return errcorrupt!("intent without transaction for key {:x?}", self.cur_key);
        };
        let meta_timestamp = meta.timestamp;
        if meta_timestamp.is_zero() {
            return errcorrupt!("intent with zero timestamp for key {:x?}", self.cur_key);
        }
        let own_intent = self.txn.as_ref().is_some_and(|txn| txn.id == meta_txn.id);

        if self.timestamp < meta_timestamp && !own_intent {
            // 5. A foreign intent above our read timestamp: it is invisible
            // to us. Read below it. (Our own intent is visible regardless
            // of timestamp and falls through to case 8.)
            let timestamp = self.timestamp;
            return self.seek_version(timestamp, false);
        }

        if !self.consistent {
            // 6. An inconsistent read at or above the intent: report the
            // intent and read the newest committed version below it.
            self.intents.push(Intent { key: self.cur_key.clone(), meta: meta.clone() });
            return self.seek_version(meta_timestamp.prev(), false);
        }

        if !own_intent {
            // 7. A consistent read of a foreign intent at or below our read
            // timestamp: record it and keep scanning, so one pass collects
            // every conflicting intent in the range. The full set surfaces
            // as a write-intent error when the scan finishes.
            self.intents.push(Intent { key: self.cur_key.clone(), meta: meta.clone() });
            return self.advance_key();
        }

        let epoch = self.txn.as_ref().expect("own intent implies txn").epoch;
        if epoch == meta_txn.epoch {
            // 8. Our own intent at our current epoch: read the provisional
            // value at the intent's timestamp, which may have been pushed
            // above our read timestamp. Transactions always see their own
            // writes.
            return self.seek_version(meta_timestamp, false);
        }

        if epoch < meta_txn.epoch {
            // 9. Our own intent from a newer epoch: this incarnation of the
            // transaction is stale and must abort.
            return Err(Error::EpochMismatch { read_epoch: epoch, intent_epoch: meta_txn.epoch });
        }

        // 10. Our own intent from an older epoch, left over from a retry:
        // ignore it and read below, as if starting fresh.
        self.seek_version(meta_timestamp.prev(), false)
    }

    /// Emits a value for the current key (empty values are deletion
    /// tombstones and emit nothing) and advances to the next user key.
    /// Returns false once max_keys + 1 rows are emitted.
    fn add_and_advance(&mut self, value: Vec<u8>) -> Result<bool> {
        if !value.is_empty() {
            self.kvs.push((self.cur_key.clone(), value));
            if self.kvs.len() as u64 > self.max_keys {
                return Ok(false);
            }
        }
        self.advance_key()
    }

    /// Advances to the version of the current key that is newest among
    /// those at or below the desired timestamp, emitting it. Steps the
    /// iterator linearly within the adaptive budget, then falls back to a
    /// seek. With check_uncertainty, any version found above the read
    /// timestamp (but at or below the desired timestamp, which is then the
    /// uncertainty window's top) is an uncertainty error.
    fn seek_version(&mut self, desired_timestamp: Timestamp, check_uncertainty: bool) -> Result<bool> {
        self.key_buf.clear();
        self.key_buf.extend_from_slice(&self.cur_key);

        for _ in 0..self.iters_before_seek {
            if !self.iter_next()? {
                return self.advance_key_at_end();
            }
            if self.cur_key != self.key_buf {
                self.iters_before_seek = MAX_ITERS_BEFORE_SEEK.min(self.iters_before_seek + 1);
                let key = self.key_buf.clone();
                return self.advance_key_at_new_key(&key);
            }
            if desired_timestamp >= self.cur_ts {
                self.iters_before_seek = MAX_ITERS_BEFORE_SEEK.min(self.iters_before_seek + 1);
                if check_uncertainty && self.timestamp < self.cur_ts {
                    return Err(Error::Uncertainty(self.cur_ts));
                }
                let value = self.cur_value.clone();
                return self.add_and_advance(value);
            }
        }

        self.iters_before_seek = 1.max(self.iters_before_seek - 1);
        let seek_key = encode_key(&self.key_buf, desired_timestamp);
        if !self.iter_seek(&seek_key)? {
            return self.advance_key_at_end();
        }
        if self.cur_key != self.key_buf {
            let key = self.key_buf.clone();
            return self.advance_key_at_new_key(&key);
        }
        if desired_timestamp >= self.cur_ts {
            if check_uncertainty && self.timestamp < self.cur_ts {
                return Err(Error::Uncertainty(self.cur_ts));
            }
            let value = self.cur_value.clone();
            return self.add_and_advance(value);
        }
        self.advance_key()
    }

    /// Advances to the next user key in scan order.
    fn advance_key(&mut self) -> Result<bool> {
        if self.reverse {
            let key = self.cur_key.clone();
            self.prev_key(&key)
        } else {
            self.next_key()
        }
    }

    /// Handles running off the end of the iterator mid-advance. A reverse
    /// scan repositions at the very last key and backs up from there; a
    /// forward scan is simply done.
    fn advance_key_at_end(&mut self) -> Result<bool> {
        if self.reverse {
            self.clear_peeked();
            self.iter.seek_to_last()?;
            if !self.update_current()? {
                return Ok(false);
            }
            self.advance_key()
        } else {
            Ok(false)
        }
    }

    /// Handles landing on a different user key mid-advance. A reverse scan
    /// must back up to the key before the one given; a forward scan is
    /// already in the right place.
    fn advance_key_at_new_key(&mut self, key: &[u8]) -> Result<bool> {
        if self.reverse {
            self.prev_key(key)
        } else {
            Ok(true)
        }
    }

    /// Advances the iterator to the first entry of the next user key after
    /// the current one. Returns false if the iterator is exhausted.
    fn next_key(&mut self) -> Result<bool> {
        // If the end key is exactly the next key after the current one,
        // we're done without moving the iterator. Point lookups hit this
        // every time.
        if self.end_key.len() == self.cur_key.len() + 1
            && self.end_key.starts_with(&self.cur_key)
            && self.end_key.last() == Some(&0)
        {
            return Ok(false);
        }

        self.key_buf.clear();
        self.key_buf.extend_from_slice(&self.cur_key);

        for _ in 0..self.iters_before_seek {
            if !self.iter_next()? {
                return Ok(false);
            }
            if self.cur_key != self.key_buf {
                self.iters_before_seek = MAX_ITERS_BEFORE_SEEK.min(self.iters_before_seek + 1);
                return Ok(true);
            }
        }

        // Still on a version of the same key: seek to the next user key.
        // Appending two NULs forms the encoding of the current key's
        // immediate successor with a zero timestamp suffix.
        self.iters_before_seek = 1.max(self.iters_before_seek - 1);
        let mut seek_key = self.key_buf.clone();
        seek_key.extend_from_slice(&[0, 0]);
        self.iter_seek(&seek_key)
    }

    /// Backs the iterator up to the newest version of the given key, which
    /// it is currently positioned somewhere within. The step count `i`
    /// continues the caller's budget. Returns false if the iterator is
    /// exhausted.
    fn backward_latest_version(&mut self, key: &[u8], mut i: usize) -> Result<bool> {
        self.key_buf.clear();
        self.key_buf.extend_from_slice(key);

        while i < self.iters_before_seek {
            let Some(peeked_key) = self.iter_peek_prev()? else {
                return Ok(false);
            };
            if peeked_key != self.key_buf {
                // The previous entry belongs to another key, so the current
                // entry is the newest version.
                self.iters_before_seek = MAX_ITERS_BEFORE_SEEK.min(self.iters_before_seek + 1);
                return Ok(true);
            }
            if !self.iter_prev()? {
                return Ok(false);
            }
            i += 1;
        }

        // Seek directly to the key's metadata position, which precedes all
        // of its versions.
        self.iters_before_seek = 1.max(self.iters_before_seek - 1);
        let mut seek_key = self.key_buf.clone();
        seek_key.push(0);
        self.iter_seek(&seek_key)
    }

    /// Moves the iterator to the newest version of the user key preceding
    /// the given one. Returns false if the iterator is exhausted or the
    /// scan's lower bound is passed.
    fn prev_key(&mut self, key: &[u8]) -> Result<bool> {
        if self.peeked && self.iter.valid() && self.iter.key() < self.end_key.as_slice() {
            // The peeked entry is already below the scan bound.
            return Ok(false);
        }

        self.key_buf.clear();
        self.key_buf.extend_from_slice(key);

        for i in 0..self.iters_before_seek {
            let Some(peeked_key) = self.iter_peek_prev()? else {
                return Ok(false);
            };
            if peeked_key != self.key_buf {
                return self.backward_latest_version(&peeked_key, i + 1);
            }
            if !self.iter_prev()? {
                return Ok(false);
            }
        }

        self.iters_before_seek = 1.max(self.iters_before_seek - 1);
        let mut seek_key = self.key_buf.clone();
        seek_key.push(0);
        self.iter_seek_reverse(&seek_key)
    }

    /// Refreshes the owned copies of the current entry from the iterator.
    /// Returns false if the iterator is exhausted.
    fn update_current(&mut self) -> Result<bool> {
        if !self.iter.valid() {
            return Ok(false);
        }
        let (key, ts) = decode_key(self.iter.key())
            .map_err(|err| Error::Corruption(format!("failed to split mvcc key: {err}")))?;
        self.cur_key.clear();
        self.cur_key.extend_from_slice(key);
        self.cur_ts = ts;
        self.cur_value.clear();
        self.cur_value.extend_from_slice(self.iter.value());
        Ok(true)
    }

    /// Positions the iterator at the first entry at or after the encoded
    /// key. Returns false if there is none.
    fn iter_seek(&mut self, key: &[u8]) -> Result<bool> {
        self.clear_peeked();
        self.iter.seek(key)?;
        self.update_current()
    }

    /// Positions the iterator at the newest version of the last user key
    /// ordered strictly before the encoded key. Returns false if there is
    /// none.
    fn iter_seek_reverse(&mut self, key: &[u8]) -> Result<bool> {
        self.clear_peeked();
        self.iter.seek_for_prev(key)?;
        if !self.update_current()? {
            return Ok(false);
        }
        if self.cur_ts.is_zero() {
            // We landed on an intent or inline value, which is already the
            // first entry of its key.
            return Ok(true);
        }
        // We landed on a version row; back up to the newest version.
        let key = self.cur_key.clone();
        self.backward_latest_version(&key, 0)
    }

    /// Steps the iterator forward, first cancelling any peek (which takes
    /// an extra step, since the iterator is physically one entry back).
    fn iter_next(&mut self) -> Result<bool> {
        if self.reverse && self.peeked {
            self.peeked = false;
            self.iter.next()?;
            if !self.iter.valid() {
                return Ok(false);
            }
        }
        self.iter.next()?;
        self.update_current()
    }

    /// Steps the iterator backward. When peeked, the iterator is already on
    /// the previous entry; adopting it is enough.
    fn iter_prev(&mut self) -> Result<bool> {
        if self.peeked {
            self.peeked = false;
            return self.update_current();
        }
        self.iter.prev()?;
        self.update_current()
    }

    /// Peeks at the user key of the entry before the current one, without
    /// disturbing the current entry: the iterator moves back one step while
    /// the owned cur_* copies keep serving the current entry. Returns None
    /// if the iterator is exhausted, and an empty key when the current
    /// entry is the first in the store (reverse scans therefore cannot
    /// reach the empty user key).
    fn iter_peek_prev(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.peeked {
            self.peeked = true;
            self.iter.prev()?;
            if !self.iter.valid() {
                // Never leave the iterator invalid from a peek: reposition
                // at the first entry and report an empty peeked key.
                self.peeked = false;
                self.iter.seek_to_first()?;
                if !self.update_current()? {
                    return Ok(None);
                }
                return Ok(Some(Vec::new()));
            }
        }
        let (key, _) = split_key(self.iter.key())
            .map_err(|err| Error::Corruption(format!("failed to split mvcc key: {err}")))?;
        Ok(Some(key.to_vec()))
    }

    /// Cancels any outstanding peek. Must be called before seeking the
    /// underlying iterator.
    fn clear_peeked(&mut self) {
        if self.reverse {
            self.peeked = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::storage::engine::{IterOptions, Store as _};
    use crate::storage::memory::Memory;
    use crate::storage::mvcc::{make_value, TAG_BYTES};

    use pretty_assertions::assert_eq;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    fn txn(id: &[u8], epoch: u32, max_timestamp: Timestamp) -> TxnMeta {
        TxnMeta { id: id.to_vec(), epoch, max_timestamp }
    }

    /// Writes a version row.
    fn put_version(store: &Memory, key: &[u8], stamp: Timestamp, value: &[u8]) {
        store.put(&encode_key(key, stamp), value).unwrap()
    }

    /// Writes an intent: the metadata row plus the provisional version row.
    fn put_intent(store: &Memory, key: &[u8], stamp: Timestamp, value: &[u8], writer: &TxnMeta) {
        let meta = MVCCMetadata {
            txn: Some(writer.clone()),
            timestamp: stamp,
            key_bytes: 12,
            val_bytes: value.len() as u64,
            ..Default::default()
        };
        store.put(&encode_key(key, Timestamp::ZERO), &meta.encode().unwrap()).unwrap();
        put_version(store, key, stamp, value);
    }

    /// Writes an inline value.
    fn put_inline(store: &Memory, key: &[u8], value: &[u8]) {
        let meta =
            MVCCMetadata { raw_bytes: Some(value.to_vec()), ..Default::default() };
        store.put(&encode_key(key, Timestamp::ZERO), &meta.encode().unwrap()).unwrap();
    }

    fn scan_all(
        store: &Memory,
        start: &[u8],
        end: &[u8],
        stamp: Timestamp,
        txn: Option<&TxnMeta>,
        consistent: bool,
        reverse: bool,
    ) -> Result<ScanResult> {
        let mut iter = store.iter(IterOptions::default())?;
        scan(&mut iter, start, end, stamp, u64::MAX - 1, txn, consistent, reverse)
    }

    fn get_one(
        store: &Memory,
        key: &[u8],
        stamp: Timestamp,
        txn: Option<&TxnMeta>,
        consistent: bool,
    ) -> Result<(Option<Vec<u8>>, Option<Intent>)> {
        let mut iter = store.iter(IterOptions::default())?;
        get(&mut iter, key, stamp, txn, consistent)
    }

    fn kv(key: &[u8], value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (key.to_vec(), value.to_vec())
    }

    #[test]
    fn read_at_timestamp_selects_version() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"k", ts(5), b"v5");
        put_version(&store, b"k", ts(3), b"v3");

        // A read between versions sees the older one.
        let result = scan_all(&store, b"k", b"k\x00", ts(4), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v3")]);

        // A read at or above the newest version sees it.
        let result = scan_all(&store, b"k", b"k\x00", ts(5), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v5")]);

        // A read below all versions sees nothing.
        let result = scan_all(&store, b"k", b"k\x00", ts(2), None, true, false)?;
        assert_eq!(result.kvs, vec![]);

        // Point gets agree.
        assert_eq!(get_one(&store, b"k", ts(4), None, true)?.0, Some(b"v3".to_vec()));
        assert_eq!(get_one(&store, b"k", ts(2), None, true)?.0, None);
        Ok(())
    }

    #[test]
    fn uncertainty_interval_restarts() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"k", ts(10), b"v10");

        // A version inside (read_ts, max_ts] is an uncertainty error at the
        // offending version's timestamp.
        let reader = txn(b"x", 1, ts(12));
        let result = scan_all(&store, b"k", b"k\x00", ts(5), Some(&reader), true, false);
        assert_eq!(result, Err(Error::Uncertainty(ts(10))));

        // A version above the window is simply invisible.
        let reader = txn(b"x", 1, ts(8));
        let result = scan_all(&store, b"k", b"k\x00", ts(5), Some(&reader), true, false)?;
        assert_eq!(result.kvs, vec![]);

        // Without a transaction there is no uncertainty.
        let result = scan_all(&store, b"k", b"k\x00", ts(5), None, true, false)?;
        assert_eq!(result.kvs, vec![]);
        Ok(())
    }

    #[test]
    fn uncertainty_found_below_newest_version() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"k", ts(20), b"v20");
        put_version(&store, b"k", ts(10), b"v10");
        put_version(&store, b"k", ts(2), b"v2");

        // The newest version is above the window, but a deeper version
        // falls inside it: still an uncertainty error.
        let reader = txn(b"x", 1, ts(12));
        let result = scan_all(&store, b"k", b"k\x00", ts(5), Some(&reader), true, false);
        assert_eq!(result, Err(Error::Uncertainty(ts(10))));
        Ok(())
    }

    #[test]
    fn own_intent_epochs() -> Result<()> {
        let store = Memory::new();
        let writer = txn(b"x", 2, ts(0));
        put_version(&store, b"k", ts(2), b"v2");
        put_intent(&store, b"k", ts(7), b"v7", &writer);

        // Same epoch: the transaction reads its own provisional write, even
        // above its read timestamp.
        let reader = txn(b"x", 2, ts(0));
        let result = scan_all(&store, b"k", b"k\x00", ts(4), Some(&reader), true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v7")]);

        // An older reader epoch must abort.
        let reader = txn(b"x", 1, ts(0));
        let result = scan_all(&store, b"k", b"k\x00", ts(4), Some(&reader), true, false);
        assert_eq!(result, Err(Error::EpochMismatch { read_epoch: 1, intent_epoch: 2 }));

        // A newer reader epoch ignores the stale intent and reads below it.
        let reader = txn(b"x", 3, ts(0));
        let result = scan_all(&store, b"k", b"k\x00", ts(4), Some(&reader), true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v2")]);
        Ok(())
    }

    #[test]
    fn foreign_intent_below_read_timestamp() -> Result<()> {
        let store = Memory::new();
        let writer = txn(b"y", 1, ts(0));
        put_version(&store, b"k", ts(3), b"v3");
        put_intent(&store, b"k", ts(5), b"v5", &writer);

        // A consistent read collects the intent and fails.
        let intents = match scan_all(&store, b"k", b"k\x00", ts(8), None, true, false) {
            Err(Error::WriteIntent(intents)) => intents,
            result => panic!("expected write intent error, got {result:?}"),
        };
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].key, b"k");
        assert_eq!(intents[0].meta.txn.as_ref().unwrap().id, b"y");

        // An inconsistent read returns the version below the intent, plus
        // the intent on the side.
        let result = scan_all(&store, b"k", b"k\x00", ts(8), None, false, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v3")]);
        assert_eq!(result.intents.len(), 1);

        // Gets surface the same intent.
        let (value, intent) = get_one(&store, b"k", ts(8), None, false)?;
        assert_eq!(value, Some(b"v3".to_vec()));
        assert_eq!(intent.unwrap().key, b"k");
        Ok(())
    }

    #[test]
    fn foreign_intent_above_read_timestamp_is_invisible() -> Result<()> {
        let store = Memory::new();
        let writer = txn(b"y", 1, ts(0));
        put_version(&store, b"k", ts(3), b"v3");
        put_intent(&store, b"k", ts(9), b"v9", &writer);

        // Reading below the intent ignores it entirely, even consistently.
        let result = scan_all(&store, b"k", b"k\x00", ts(5), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", b"v3")]);
        assert_eq!(result.intents, vec![]);
        Ok(())
    }

    #[test]
    fn consistent_scan_collects_all_intents() -> Result<()> {
        let store = Memory::new();
        let writer = txn(b"y", 1, ts(0));
        put_intent(&store, b"a", ts(5), b"a5", &writer);
        put_version(&store, b"b", ts(1), b"b1");
        put_intent(&store, b"c", ts(6), b"c6", &writer);

        let intents = match scan_all(&store, b"a", b"z", ts(8), None, true, false) {
            Err(Error::WriteIntent(intents)) => intents,
            result => panic!("expected write intent error, got {result:?}"),
        };
        // One pass reports both intents, not just the first.
        assert_eq!(
            intents.iter().map(|i| i.key.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"c".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn inline_values_ignore_timestamps() -> Result<()> {
        let store = Memory::new();
        let inline = make_value(TAG_BYTES, b"inline");
        put_inline(&store, b"k", &inline);

        let result = scan_all(&store, b"k", b"k\x00", ts(1), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"k", &inline)]);
        let (value, _) = get_one(&store, b"k", Timestamp::ZERO, None, true)?;
        assert_eq!(value, Some(inline));
        Ok(())
    }

    #[test]
    fn tombstones_hide_keys() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"a", ts(1), b"a1");
        put_version(&store, b"a", ts(5), b""); // deletion tombstone
        put_version(&store, b"b", ts(1), b"b1");

        let result = scan_all(&store, b"a", b"z", ts(8), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"b", b"b1")]);

        // Below the tombstone the key is visible again.
        let result = scan_all(&store, b"a", b"z", ts(3), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"a", b"a1"), kv(b"b", b"b1")]);
        Ok(())
    }

    #[test]
    fn scan_bounds_and_max_keys() -> Result<()> {
        let store = Memory::new();
        for key in [b"a", b"b", b"c", b"d"] {
            put_version(&store, key, ts(1), key);
        }

        // Bounds are [start, end).
        let result = scan_all(&store, b"b", b"d", ts(5), None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"b", b"b"), kv(b"c", b"c")]);

        // max_keys emits one extra row to signal the resume key.
        let mut iter = store.iter(IterOptions::default())?;
        let result = scan(&mut iter, b"a", b"z", ts(5), 2, None, true, false)?;
        assert_eq!(result.kvs, vec![kv(b"a", b"a"), kv(b"b", b"b"), kv(b"c", b"c")]);
        Ok(())
    }

    #[test]
    fn reverse_scan() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"a", ts(3), b"a3");
        put_version(&store, b"a", ts(1), b"a1");
        put_version(&store, b"b", ts(2), b"b2");
        put_version(&store, b"c", ts(1), b"c1");
        put_version(&store, b"d", ts(1), b"d1");

        // Reverse scans return [start, end) in descending key order, with
        // each key read at the scan timestamp.
        let result = scan_all(&store, b"a", b"d", ts(5), None, true, true)?;
        assert_eq!(result.kvs, vec![kv(b"c", b"c1"), kv(b"b", b"b2"), kv(b"a", b"a3")]);

        // Timestamps still select versions.
        let result = scan_all(&store, b"a", b"d", ts(1), None, true, true)?;
        assert_eq!(result.kvs, vec![kv(b"c", b"c1"), kv(b"a", b"a1")]);
        Ok(())
    }

    #[test]
    fn reverse_scan_with_metadata_rows() -> Result<()> {
        let store = Memory::new();
        let writer = txn(b"y", 1, ts(0));
        put_version(&store, b"a", ts(2), b"a2");
        put_intent(&store, b"b", ts(5), b"b5", &writer);
        put_version(&store, b"c", ts(1), b"c1");

        // The reverse scan reads below the foreign intent inconsistently
        // and reports it.
        let result = scan_all(&store, b"a", b"z", ts(8), None, false, true)?;
        assert_eq!(result.kvs, vec![kv(b"c", b"c1"), kv(b"a", b"a2")]);
        assert_eq!(result.intents.len(), 1);
        Ok(())
    }

    #[test]
    fn reverse_scan_through_many_versions() -> Result<()> {
        let store = Memory::new();
        // Enough versions to exhaust the linear-step budget and force the
        // seek fallback paths in both directions.
        for wall in 1..=25 {
            put_version(&store, b"a", ts(wall), format!("a{wall}").as_bytes());
            put_version(&store, b"b", ts(wall), format!("b{wall}").as_bytes());
        }
        put_version(&store, b"c", ts(1), b"c1");

        let result = scan_all(&store, b"a", b"z", ts(100), None, true, true)?;
        assert_eq!(
            result.kvs,
            vec![kv(b"c", b"c1"), kv(b"b", b"b25"), kv(b"a", b"a25")]
        );

        let result = scan_all(&store, b"a", b"z", ts(3), None, true, true)?;
        assert_eq!(result.kvs, vec![kv(b"c", b"c1"), kv(b"b", b"b3"), kv(b"a", b"a3")]);
        Ok(())
    }

    #[test]
    fn get_does_not_see_other_keys() -> Result<()> {
        let store = Memory::new();
        put_version(&store, b"a", ts(1), b"a1");
        put_version(&store, b"c", ts(1), b"c1");

        // A get of a missing key between existing keys finds nothing.
        assert_eq!(get_one(&store, b"b", ts(5), None, true)?.0, None);
        Ok(())
    }

    #[test]
    fn adaptive_step_budget() -> Result<()> {
        let store = Memory::new();
        for wall in 1..=15 {
            put_version(&store, b"a", ts(wall), b"v");
        }
        put_version(&store, b"b", ts(1), b"b1");

        // Walking from a's newest version to key b crosses 15 versions,
        // exhausting the initial budget of 5 and falling back to a seek,
        // which shrinks the budget.
        let mut iter = store.iter(IterOptions::default())?;
        let mut scanner =
            Scanner::new(&mut iter, b"a", b"z", ts(100), u64::MAX - 1, None, true, false);
        assert!(scanner.iter_seek(&encode_key(b"a", Timestamp::ZERO))?);
        assert_eq!(scanner.iters_before_seek, MAX_ITERS_BEFORE_SEEK / 2);
        assert!(scanner.next_key()?);
        assert_eq!(scanner.cur_key, b"b");
        assert_eq!(scanner.iters_before_seek, MAX_ITERS_BEFORE_SEEK / 2 - 1);

        // Walking from b (one version) to the end stays within budget; the
        // budget grows on success. Here the iterator exhausts instead,
        // so step once more over a short key run to observe growth.
        let store = Memory::new();
        put_version(&store, b"a", ts(2), b"v");
        put_version(&store, b"a", ts(1), b"v");
        put_version(&store, b"b", ts(1), b"b1");
        let mut iter = store.iter(IterOptions::default())?;
        let mut scanner =
            Scanner::new(&mut iter, b"a", b"z", ts(100), u64::MAX - 1, None, true, false);
        assert!(scanner.iter_seek(&encode_key(b"a", Timestamp::ZERO))?);
        assert!(scanner.next_key()?);
        assert_eq!(scanner.cur_key, b"b");
        assert_eq!(scanner.iters_before_seek, MAX_ITERS_BEFORE_SEEK / 2 + 1);
        Ok(())
    }

    #[test]
    fn scan_empty_store() -> Result<()> {
        let store = Memory::new();
        let result = scan_all(&store, b"a", b"z", ts(1), None, true, false)?;
        assert_eq!(result, ScanResult::default());
        let result = scan_all(&store, b"a", b"z", ts(1), None, true, true)?;
        assert_eq!(result, ScanResult::default());
        Ok(())
    }
}
