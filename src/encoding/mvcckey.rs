//! The MVCC sort-key encoding. An MVCC key combines an opaque user key with
//! an optional hybrid-logical timestamp:
//!
//! ```text
//! <user-key> [0x00 <wall:u64 big-endian> [<logical:u32 big-endian>]] <ts-len:u8>
//! ```
//!
//! The trailing length byte counts the bracketed region (0, 9, or 13 bytes),
//! so a key without a timestamp encodes as `<user-key> 0x00`. The NUL before
//! the timestamp data is a prefix guard: [`key_prefix`] returns
//! `<user-key> 0x00` for both timestamped and timestampless keys, so per-key
//! bloom filters and prefix-bounded iteration see a consistent prefix.
//!
//! These keys do not sort correctly under plain lexicographic comparison.
//! [`compare`] provides the intended total order: user keys ascending, then
//! timestamps descending, with the timestampless (metadata) flavor of a user
//! key ordered before all of its timestamped versions. The layout is an
//! on-disk format shared with other readers of the same stores; it must not
//! change.

use crate::error::Result;
use crate::hlc::Timestamp;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The encoded size of a version timestamp: 8 bytes of wall time and 4 bytes
/// of logical tiebreaker. Statistics charge this much key overhead per
/// version regardless of whether the logical component was elided.
pub const VERSION_TIMESTAMP_SIZE: u64 = 12;

/// Appends the timestamp encoding to buf: big-endian wall time, then the
/// big-endian logical component only if nonzero.
fn encode_timestamp_into(buf: &mut Vec<u8>, ts: Timestamp) {
    buf.extend_from_slice(&(ts.wall_time as u64).to_be_bytes());
    if ts.logical != 0 {
        buf.extend_from_slice(&(ts.logical as u32).to_be_bytes());
    }
}

/// Encodes a timestamp by itself, without the NUL prefix or length suffix.
/// This is the representation stored in time-bound table properties, where
/// lexicographic byte order must match timestamp order (it does, because the
/// encoding is big-endian).
pub fn encode_timestamp(ts: Timestamp) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_TIMESTAMP_SIZE as usize);
    encode_timestamp_into(&mut buf, ts);
    buf
}

/// Encodes an MVCC key. A zero timestamp produces a metadata key.
pub fn encode_key(key: &[u8], ts: Timestamp) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 2 + VERSION_TIMESTAMP_SIZE as usize);
    buf.extend_from_slice(key);
    if !ts.is_zero() {
        buf.push(0);
        encode_timestamp_into(&mut buf, ts);
    }
    buf.push((buf.len() - key.len()) as u8);
    buf
}

/// Splits an encoded MVCC key into its user key and timestamp portion using
/// the trailing length byte. The timestamp portion retains the NUL prefix
/// guard and is empty for metadata keys. Fails if the length byte is
/// inconsistent with the buffer.
pub fn split_key(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    let Some(&ts_len) = buf.last() else {
        return errcorrupt!("empty mvcc key");
    };
    let ts_len = ts_len as usize;
    if ts_len >= buf.len() {
        return errcorrupt!("mvcc key {buf:x?} has invalid timestamp length {ts_len}");
    }
    let key_len = buf.len() - ts_len - 1;
    Ok((&buf[..key_len], &buf[key_len..buf.len() - 1]))
}

/// Decodes a timestamp from its raw encoding (no NUL prefix, no length
/// suffix): 8 bytes of wall time, optionally followed by 4 bytes of logical.
pub fn decode_timestamp(ts: &[u8]) -> Result<Timestamp> {
    let (wall, rest) = match ts.split_first_chunk::<8>() {
        Some((wall, rest)) => (u64::from_be_bytes(*wall) as i64, rest),
        None => return errcorrupt!("timestamp {ts:x?} is too short"),
    };
    let logical = match rest.len() {
        0 => 0,
        4 => u32::from_be_bytes(rest.try_into().expect("length checked")) as i32,
        _ => return errcorrupt!("timestamp {ts:x?} has invalid length"),
    };
    Ok(Timestamp { wall_time: wall, logical })
}

/// Decodes an encoded MVCC key into its user key and timestamp. Metadata
/// keys decode with a zero timestamp.
pub fn decode_key(buf: &[u8]) -> Result<(&[u8], Timestamp)> {
    let (key, ts) = split_key(buf)?;
    if ts.is_empty() {
        return Ok((key, Timestamp::ZERO));
    }
    // Strip the NUL prefix guard.
    Ok((key, decode_timestamp(&ts[1..])?))
}

/// Returns the per-user-key prefix of an encoded MVCC key: the user key with
/// a single trailing NUL. For a metadata key this is the entire encoding; for
/// a version key it is the portion before the timestamp data. Prefixes must
/// themselves be comparable with complete encoded keys, which the trailing
/// NUL (a zero length byte) provides. Undecodable keys are their own prefix.
pub fn key_prefix(buf: &[u8]) -> &[u8] {
    let Ok((key, _)) = split_key(buf) else {
        return buf;
    };
    debug_assert!(buf.len() > key.len() && buf[key.len()] == 0);
    &buf[..key.len() + 1]
}

/// Compares two encoded MVCC keys: user keys ascending, then timestamps
/// descending, with a timestampless key before any timestamped version of the
/// same user key. Keys that fail to split compare lexicographically, which
/// should only happen for corrupted data; the order must still be total so
/// the store does not misbehave before the corruption is reported.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    let (Ok((key_a, ts_a)), Ok((key_b, ts_b))) = (split_key(a), split_key(b)) else {
        return a.cmp(b);
    };
    key_a.cmp(key_b).then_with(|| match (ts_a.is_empty(), ts_b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // Reversed: the newer timestamp sorts first.
        (false, false) => ts_b.cmp(ts_a),
    })
}

/// An owned encoded MVCC key ordered by [`compare`]. Used wherever encoded
/// keys are kept in ordered collections.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SortKey(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Vec<u8>> for SortKey {
    fn from(buf: Vec<u8>) -> Self {
        SortKey(buf)
    }
}

impl AsRef<[u8]> for SortKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
