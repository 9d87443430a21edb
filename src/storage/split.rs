//! Range split point selection: a single pass over a key range that finds
//! the user key dividing the range's byte size closest to a target, while
//! avoiding keys a range boundary must never land on.

use super::engine::Iter;
use crate::encoding::mvcckey::{compare, decode_key, encode_key, VERSION_TIMESTAMP_SIZE};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;

use std::cmp::Ordering;

/// Finds the best split key in [start, end): the user key whose cumulative
/// preceding byte size is closest to target_size, subject to being a valid
/// split point, at or after min_split, and never the range's first key.
/// Returns None if no valid candidate exists.
pub fn find_split_key<I: Iter>(
    iter: &mut I,
    start: &[u8],
    end: &[u8],
    min_split: &[u8],
    target_size: i64,
    allow_meta2_splits: bool,
) -> Result<Option<Vec<u8>>> {
    iter.seek(&encode_key(start, Timestamp::ZERO))?;
    let end_key = encode_key(end, Timestamp::ZERO);

    let mut size_so_far: i64 = 0;
    let mut best_split_key: Option<Vec<u8>> = None;
    let mut best_split_diff = i64::MAX;
    let mut prev_key: Vec<u8> = Vec::new();
    let mut n = 0;

    while iter.valid() && compare(iter.key(), &end_key) == Ordering::Less {
        let value_len = iter.value().len() as i64;
        let (decoded_key, ts) = decode_key(iter.key())
            .map_err(|err| Error::Corruption(format!("unable to decode key: {err}")))?;
        let decoded_key = decoded_key.to_vec();

        n += 1;
        // The first key can never be a split point: a split there would
        // leave an empty left-hand range.
        let valid = n > 1
            && keys::is_valid_split_key(&decoded_key, allow_meta2_splits)
            && decoded_key.as_slice() >= min_split;
        let diff = (target_size - size_so_far).abs();
        if valid && diff < best_split_diff {
            best_split_key = Some(decoded_key.clone());
            best_split_diff = diff;
        }
        // Once the distance to the target starts growing, it will only keep
        // growing; stop as soon as some valid candidate is in hand.
        if diff > best_split_diff && best_split_key.is_some() {
            break;
        }

        let is_value = !ts.is_zero();
        if is_value && decoded_key == prev_key {
            // Another version of the same key.
            size_so_far += VERSION_TIMESTAMP_SIZE as i64 + value_len;
        } else {
            // The first row of a new key.
            size_so_far += decoded_key.len() as i64 + 1 + value_len;
            if is_value {
                size_so_far += VERSION_TIMESTAMP_SIZE as i64;
            }
        }
        prev_key = decoded_key;

        iter.next()?;
    }

    Ok(best_split_key)
}
