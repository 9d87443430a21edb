//! MVCC statistics: a single forward pass over a key range that classifies
//! every row and accumulates the aggregates used for range accounting,
//! garbage collection scheduling, and rebalancing decisions.
//!
//! Garbage ages accrue in byte-seconds using integer-divided seconds: the
//! age factor is `to/1e9 - from/1e9` with both divisions truncating, which
//! is not the same as dividing the difference. Incremental stat updates
//! applied elsewhere age the same way, and the two must agree exactly.

use super::engine::Iter;
use super::mvcc::MVCCMetadata;
use crate::encoding::mvcckey::{compare, decode_key, encode_key, VERSION_TIMESTAMP_SIZE};
use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Aggregate MVCC statistics for a key range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Bytes of live (visible at the newest timestamp) keys and values.
    pub live_bytes: i64,
    /// Number of live user keys.
    pub live_count: i64,
    /// Bytes of all user key encodings, live or not.
    pub key_bytes: i64,
    /// Number of user keys.
    pub key_count: i64,
    /// Bytes of all values, live or not.
    pub val_bytes: i64,
    /// Number of values (versions and non-empty metadata rows).
    pub val_count: i64,
    /// Bytes of intent metadata and provisional values.
    pub intent_bytes: i64,
    /// Number of intents.
    pub intent_count: i64,
    /// Accumulated age of intents, in seconds.
    pub intent_age: i64,
    /// Accumulated age of garbage (shadowed or deleted) bytes, in
    /// byte-seconds.
    pub gc_bytes_age: i64,
    /// Bytes of system keys (below the local-max boundary).
    pub sys_bytes: i64,
    /// Number of system keys.
    pub sys_count: i64,
    /// The wall time these statistics are aged to, in nanoseconds.
    pub last_update_nanos: i64,
}

impl encoding::Value for Stats {}

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// The age factor between two nanosecond wall times, in whole seconds.
/// Each operand is divided down to seconds before subtracting; dividing the
/// difference instead would disagree with incremental aging.
fn age_factor(from_nanos: i64, to_nanos: i64) -> i64 {
    to_nanos / NANOS_PER_SECOND - from_nanos / NANOS_PER_SECOND
}

/// Computes MVCC statistics for the user key range [start, end) as of
/// now_nanos, driving the given iterator.
pub fn compute_stats<I: Iter>(
    iter: &mut I,
    start: &[u8],
    end: &[u8],
    now_nanos: i64,
) -> Result<Stats> {
    let mut stats = Stats::default();

    iter.seek(&encode_key(start, Timestamp::ZERO))?;
    let end_key = encode_key(end, Timestamp::ZERO);

    let mut meta = MVCCMetadata::default();
    let mut prev_key: Vec<u8> = Vec::new();
    let mut first = false;
    // The timestamp from which a non-tombstone version accrues garbage age:
    // the timestamp of the version that shadowed it.
    let mut accrue_gc_age_nanos: i64 = 0;

    while iter.valid() && compare(iter.key(), &end_key) == Ordering::Less {
        let value_len = iter.value().len() as i64;
        let (decoded_key, ts) = decode_key(iter.key())
            .map_err(|err| Error::Corruption(format!("unable to decode key: {err}")))?;
        let decoded_key = decoded_key.to_vec();

        let is_sys = decoded_key.as_slice() < keys::LOCAL_MAX;
        let is_value = !ts.is_zero();
        // A key with versions but no metadata row gets an implicit one.
        let implicit_meta = is_value && decoded_key != prev_key;
        prev_key = decoded_key.clone();

        if implicit_meta {
            meta = MVCCMetadata {
                key_bytes: VERSION_TIMESTAMP_SIZE,
                val_bytes: value_len as u64,
                deleted: value_len == 0,
                timestamp: Timestamp::new(ts.wall_time, 0),
                ..Default::default()
            };
        }

        if !is_value || implicit_meta {
            let meta_key_size = decoded_key.len() as i64 + 1;
            let meta_val_size = if implicit_meta { 0 } else { value_len };
            let total_bytes = meta_key_size + meta_val_size;
            first = true;

            if !implicit_meta {
                meta = MVCCMetadata::decode(iter.value()).map_err(|err| {
                    Error::Corruption(format!("unable to decode mvcc metadata: {err}"))
                })?;
            }

            if is_sys {
                stats.sys_bytes += total_bytes;
                stats.sys_count += 1;
            } else {
                if !meta.deleted {
                    stats.live_bytes += total_bytes;
                    stats.live_count += 1;
                } else {
                    stats.gc_bytes_age +=
                        total_bytes * age_factor(meta.timestamp.wall_time, now_nanos);
                }
                stats.key_bytes += meta_key_size;
                stats.val_bytes += meta_val_size;
                stats.key_count += 1;
                if meta.raw_bytes.is_some() {
                    stats.val_count += 1;
                }
            }
            if !implicit_meta {
                iter.next()?;
                continue;
            }
        }

        let total_bytes = value_len + VERSION_TIMESTAMP_SIZE as i64;
        if is_sys {
            stats.sys_bytes += total_bytes;
        } else {
            if first {
                // The newest version, described by the metadata row.
                first = false;
                if !meta.deleted {
                    stats.live_bytes += total_bytes;
                } else {
                    stats.gc_bytes_age +=
                        total_bytes * age_factor(meta.timestamp.wall_time, now_nanos);
                }
                if meta.txn.is_some() {
                    stats.intent_bytes += total_bytes;
                    stats.intent_count += 1;
                    stats.intent_age += age_factor(meta.timestamp.wall_time, now_nanos);
                }
                if meta.key_bytes != VERSION_TIMESTAMP_SIZE {
                    return errcorrupt!(
                        "expected mvcc metadata key bytes to equal {}; got {}",
                        VERSION_TIMESTAMP_SIZE,
                        meta.key_bytes
                    );
                }
                if meta.val_bytes != value_len as u64 {
                    return errcorrupt!(
                        "expected mvcc metadata val bytes to equal {}; got {}",
                        value_len,
                        meta.val_bytes
                    );
                }
                accrue_gc_age_nanos = meta.timestamp.wall_time;
            } else {
                // An older, shadowed version. A tombstone is garbage from
                // its own timestamp; a value is garbage from the timestamp
                // of the version that shadowed it.
                let is_tombstone = value_len == 0;
                if is_tombstone {
                    stats.gc_bytes_age += total_bytes * age_factor(ts.wall_time, now_nanos);
                } else {
                    debug_assert!(accrue_gc_age_nanos > 0);
                    stats.gc_bytes_age += total_bytes * age_factor(accrue_gc_age_nanos, now_nanos);
                }
                accrue_gc_age_nanos = ts.wall_time;
            }
            stats.key_bytes += VERSION_TIMESTAMP_SIZE as i64;
            stats.val_bytes += value_len;
            stats.val_count += 1;
        }

        iter.next()?;
    }

    stats.last_update_nanos = now_nanos;
    Ok(stats)
}
