//! The engine merge operator. Merge operands are serialized [`MVCCMetadata`]
//! records whose `raw_bytes` carry a value envelope. Combining two operands
//! appends the right payload to the left for plain byte envelopes, and runs
//! an offset-ordered consolidation for time series envelopes.
//!
//! The store invokes the operator in two modes. A full merge folds an
//! ordered operand list into the (optional) existing value and produces the
//! final value. A partial merge collapses two or more operands into a single
//! equivalent operand without access to the existing value; time series
//! samples are concatenated unsorted and deduplication is deferred to the
//! eventual full merge.
//!
//! Failures (unparseable operands, mismatched envelope types, mismatched
//! series parameters) are logged and reported to the store rather than
//! papered over; the store decides whether the key is dropped or surfaces a
//! corruption error. Inventing data here would silently destroy samples.

use super::mvcc::{
    self, MVCCMetadata, TimeSeriesData, TimeSeriesSample, TAG_TIMESERIES,
};
use crate::encoding::Value as _;
use crate::error::Result;

use log::warn;

/// A merge operator, invoked by the store during flushes, compactions, and
/// reads of keys with pending merge operands. Implementations must be
/// commutative with respect to operand batching: merging a partial-merge
/// result must equal merging the original operands one by one.
pub trait MergeOperator: Send + Sync {
    /// The operator name, for logging and store identification.
    fn name(&self) -> &'static str;

    /// Folds an ordered operand list into the existing value, if any,
    /// producing the final stored value.
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Result<Vec<u8>>;

    /// Collapses two or more operands into a single equivalent operand.
    fn partial_merge(&self, key: &[u8], operands: &[Vec<u8>]) -> Result<Vec<u8>>;
}

/// The MVCC merge operator. The only operator strata configures; stores are
/// opened with it installed.
pub struct MvccMergeOperator;

impl MergeOperator for MvccMergeOperator {
    fn name(&self) -> &'static str {
        "mvcc_merge_operator"
    }

    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Result<Vec<u8>> {
        let mut meta = match existing {
            Some(existing) => MVCCMetadata::decode(existing).map_err(|err| {
                warn!("merge of key {key:x?} found corrupted existing value: {err}");
                err
            })?,
            None => MVCCMetadata::default(),
        };
        for operand in operands {
            merge_operand(&mut meta, operand, true)?;
        }
        merge_result(&meta)
    }

    fn partial_merge(&self, _key: &[u8], operands: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut meta = MVCCMetadata::default();
        for operand in operands {
            merge_operand(&mut meta, operand, false)?;
        }
        merge_result(&meta)
    }
}

/// Merges a single serialized operand into the accumulator.
fn merge_operand(meta: &mut MVCCMetadata, operand: &[u8], full_merge: bool) -> Result<()> {
    let operand = MVCCMetadata::decode(operand).map_err(|err| {
        warn!("merge found corrupted operand value: {err}");
        err
    })?;
    merge_values(meta, &operand, full_merge)
}

/// Merges two full-merge results, as needed when replaying batched merge
/// records over a base value.
pub fn merge_one(existing: &[u8], update: &[u8]) -> Result<Vec<u8>> {
    let mut meta = MVCCMetadata::decode(existing)?;
    let update = MVCCMetadata::decode(update)?;
    merge_values(&mut meta, &update, true)?;
    merge_result(&meta)
}

/// Serializes the merged metadata.
// TODO: recompute the raw_bytes envelope checksum after merging. Merged
// values currently carry whatever checksum the left operand had; readers
// restamp the envelope when the value is next rewritten.
fn merge_result(meta: &MVCCMetadata) -> Result<Vec<u8>> {
    meta.encode()
}

/// Merges the right metadata record into the left. For byte envelopes the
/// right payload is appended to the left envelope. For time series envelopes
/// the sample sets are combined; a full merge consolidates them by offset.
fn merge_values(left: &mut MVCCMetadata, right: &MVCCMetadata, full_merge: bool) -> Result<()> {
    if left.raw_bytes.is_none() {
        // The accumulator is empty: adopt the right value wholesale.
        left.raw_bytes = Some(right.raw_bytes.clone().unwrap_or_default());
        if right.merge_timestamp.is_some() {
            left.merge_timestamp = right.merge_timestamp;
        }
        let raw = left.raw_bytes.as_mut().expect("just assigned");
        if full_merge && mvcc::is_time_series(raw) {
            consolidate_time_series(raw)?;
        }
        return Ok(());
    }
    let left_raw = left.raw_bytes.as_mut().expect("checked above");

    let Some(right_raw) = right.raw_bytes.as_deref() else {
        warn!("inconsistent value types for merge (left = bytes, right = none)");
        return errcorrupt!("merge operand has no value");
    };

    if mvcc::is_time_series(left_raw) || mvcc::is_time_series(right_raw) {
        if !mvcc::is_time_series(left_raw) || !mvcc::is_time_series(right_raw) {
            warn!("inconsistent value types for merging time series data");
            return errcorrupt!("cannot merge time series data with other value types");
        }
        return merge_time_series(left_raw, right_raw, full_merge);
    }

    left_raw.extend_from_slice(mvcc::value_payload(right_raw));
    Ok(())
}

/// Merges two time series envelopes in place into the left one. The series
/// must agree on start timestamp and sample duration. A full merge emits one
/// sample per offset, with the right side overriding the left; a partial
/// merge concatenates the sample sets for a later full merge to sort out.
fn merge_time_series(left: &mut Vec<u8>, right: &[u8], full_merge: bool) -> Result<()> {
    let left_ts: TimeSeriesData = mvcc::parse_value(left).map_err(|err| {
        warn!("left time series could not be parsed from bytes: {err}");
        err
    })?;
    let mut right_ts: TimeSeriesData = mvcc::parse_value(right).map_err(|err| {
        warn!("right time series could not be parsed from bytes: {err}");
        err
    })?;

    if left_ts.start_timestamp_nanos != right_ts.start_timestamp_nanos {
        warn!("time series merge failed due to mismatched start timestamps");
        return errcorrupt!("cannot merge time series with different start timestamps");
    }
    if left_ts.sample_duration_nanos != right_ts.sample_duration_nanos {
        warn!("time series merge failed due to mismatched sample durations");
        return errcorrupt!("cannot merge time series with different sample durations");
    }

    if !full_merge {
        let mut merged = left_ts;
        merged.samples.append(&mut right_ts.samples);
        *left = mvcc::serialize_value(TAG_TIMESERIES, &merged)?;
        return Ok(());
    }

    let mut merged = TimeSeriesData {
        start_timestamp_nanos: left_ts.start_timestamp_nanos,
        sample_duration_nanos: left_ts.sample_duration_nanos,
        samples: Vec::with_capacity(left_ts.samples.len() + right_ts.samples.len()),
    };

    // Sort the right samples by offset. The left samples are assumed sorted,
    // since every stored series has been consolidated. The sort must be
    // stable so that the last write at an offset wins.
    right_ts.samples.sort_by_key(|s| s.offset);

    // Merge the two sample streams. For each offset, the last sample in
    // combined scan order is kept, so right samples override left ones.
    let mut left_iter = left_ts.samples.iter().peekable();
    let mut right_iter = right_ts.samples.iter().peekable();
    while left_iter.peek().is_some() || right_iter.peek().is_some() {
        let offset = match (left_iter.peek(), right_iter.peek()) {
            (Some(l), Some(r)) => l.offset.min(r.offset),
            (Some(l), None) => l.offset,
            (None, Some(r)) => r.offset,
            (None, None) => unreachable!("loop condition"),
        };
        let mut sample = TimeSeriesSample::default();
        while left_iter.peek().is_some_and(|s| s.offset == offset) {
            sample = *left_iter.next().expect("peeked");
        }
        while right_iter.peek().is_some_and(|s| s.offset == offset) {
            sample = *right_iter.next().expect("peeked");
        }
        merged.samples.push(sample);
    }

    *left = mvcc::serialize_value(TAG_TIMESERIES, &merged)?;
    Ok(())
}

/// Consolidates a single time series envelope in place: sorts the samples by
/// offset and keeps the last sample at each offset. This is the single-value
/// equivalent of a full time series merge, applied when the first operand is
/// merged into a key with no existing value.
fn consolidate_time_series(value: &mut Vec<u8>) -> Result<()> {
    let mut ts: TimeSeriesData = mvcc::parse_value(value).map_err(|err| {
        warn!("time series could not be parsed from bytes: {err}");
        err
    })?;

    ts.samples.sort_by_key(|s| s.offset);
    let mut consolidated: Vec<TimeSeriesSample> = Vec::with_capacity(ts.samples.len());
    for sample in ts.samples {
        match consolidated.last_mut() {
            Some(last) if last.offset == sample.offset => *last = sample,
            _ => consolidated.push(sample),
        }
    }
    ts.samples = consolidated;

    *value = mvcc::serialize_value(TAG_TIMESERIES, &ts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hlc::Timestamp;
    use crate::storage::mvcc::{make_value, TAG_BYTES};

    use itertools::Itertools as _;
    use pretty_assertions::assert_eq;

    /// Builds a merge operand carrying a byte payload.
    fn bytes_operand(payload: &[u8]) -> Vec<u8> {
        let meta = MVCCMetadata {
            raw_bytes: Some(make_value(TAG_BYTES, payload)),
            ..MVCCMetadata::default()
        };
        meta.encode().unwrap()
    }

    /// Builds a merge operand carrying time series samples as (offset, sum)
    /// pairs.
    fn ts_operand(start: i64, duration: i64, samples: &[(i32, f64)]) -> Vec<u8> {
        let data = TimeSeriesData {
            start_timestamp_nanos: start,
            sample_duration_nanos: duration,
            samples: samples
                .iter()
                .map(|&(offset, sum)| TimeSeriesSample {
                    offset,
                    count: 1,
                    sum,
                    ..Default::default()
                })
                .collect(),
        };
        let meta = MVCCMetadata {
            raw_bytes: Some(mvcc::serialize_value(TAG_TIMESERIES, &data).unwrap()),
            merge_timestamp: Some(Timestamp::new(1, 0)),
            ..MVCCMetadata::default()
        };
        meta.encode().unwrap()
    }

    fn decode_samples(value: &[u8]) -> Vec<(i32, f64)> {
        let meta = MVCCMetadata::decode(value).unwrap();
        let data: TimeSeriesData = mvcc::parse_value(&meta.raw_bytes.unwrap()).unwrap();
        data.samples.iter().map(|s| (s.offset, s.sum)).collect()
    }

    #[test]
    fn bytes_concatenation() -> Result<()> {
        let op = MvccMergeOperator;
        let merged = op.full_merge(b"k", None, &[bytes_operand(b"hello"), bytes_operand(b" world")])?;
        let meta = MVCCMetadata::decode(&merged)?;
        assert_eq!(meta.raw_bytes, Some(make_value(TAG_BYTES, b"hello world")));
        Ok(())
    }

    #[test]
    fn bytes_concatenation_associative() -> Result<()> {
        let op = MvccMergeOperator;
        let (a, b, c) = (bytes_operand(b"a"), bytes_operand(b"bb"), bytes_operand(b"ccc"));

        // merge(merge(a, b), c) == merge(a, merge(b, c)).
        let left = {
            let ab = op.partial_merge(b"k", &[a.clone(), b.clone()])?;
            op.full_merge(b"k", None, &[ab, c.clone()])?
        };
        let right = {
            let bc = op.partial_merge(b"k", &[b, c])?;
            op.full_merge(b"k", None, &[a, bc])?
        };
        assert_eq!(left, right);
        Ok(())
    }

    #[test]
    fn bytes_merge_with_existing() -> Result<()> {
        let op = MvccMergeOperator;
        let existing = op.full_merge(b"k", None, &[bytes_operand(b"base")])?;
        let merged = op.full_merge(b"k", Some(&existing), &[bytes_operand(b"+more")])?;
        let meta = MVCCMetadata::decode(&merged)?;
        assert_eq!(meta.raw_bytes, Some(make_value(TAG_BYTES, b"base+more")));
        Ok(())
    }

    #[test]
    fn mismatched_envelopes_fail() {
        let op = MvccMergeOperator;
        let result =
            op.full_merge(b"k", None, &[bytes_operand(b"x"), ts_operand(100, 10, &[(1, 1.0)])]);
        assert!(matches!(result, Err(Error::Corruption(_))));

        let result =
            op.full_merge(b"k", None, &[ts_operand(100, 10, &[(1, 1.0)]), bytes_operand(b"x")]);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn mismatched_series_parameters_fail() {
        let op = MvccMergeOperator;
        let result = op.full_merge(
            b"k",
            None,
            &[ts_operand(100, 10, &[(1, 1.0)]), ts_operand(200, 10, &[(2, 2.0)])],
        );
        assert!(matches!(result, Err(Error::Corruption(_))));

        let result = op.full_merge(
            b"k",
            None,
            &[ts_operand(100, 10, &[(1, 1.0)]), ts_operand(100, 20, &[(2, 2.0)])],
        );
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn corrupted_operand_fails() {
        let op = MvccMergeOperator;
        assert!(op.full_merge(b"k", None, &[b"garbage".to_vec()]).is_err());
        assert!(op.full_merge(b"k", Some(b"garbage"), &[bytes_operand(b"x")]).is_err());
    }

    #[test]
    fn time_series_full_merge_dedupes() -> Result<()> {
        let op = MvccMergeOperator;
        // Left is sorted (as stored series always are); right is not, and
        // contains internal duplicates where the later sample must win.
        let left = ts_operand(100, 10, &[(1, 1.0), (3, 3.0), (5, 5.0)]);
        let right = ts_operand(100, 10, &[(4, 44.0), (3, 33.0), (3, 34.0), (7, 77.0)]);
        let merged = op.full_merge(b"k", None, &[left, right])?;
        assert_eq!(
            decode_samples(&merged),
            vec![(1, 1.0), (3, 34.0), (4, 44.0), (5, 5.0), (7, 77.0)]
        );
        Ok(())
    }

    #[test]
    fn time_series_partial_then_full_equals_full() -> Result<()> {
        let op = MvccMergeOperator;
        let ops = [
            ts_operand(100, 10, &[(2, 2.0), (1, 1.0)]),
            ts_operand(100, 10, &[(2, 22.0), (4, 4.0)]),
            ts_operand(100, 10, &[(3, 3.0), (2, 222.0)]),
        ];

        let full = op.full_merge(b"k", None, &ops.to_vec())?;
        let partial = op.partial_merge(b"k", &ops.to_vec())?;
        let via_partial = op.full_merge(b"k", None, &[partial])?;
        assert_eq!(decode_samples(&via_partial), decode_samples(&full));

        // The consolidated result is strictly ascending by offset with the
        // last write at each offset retained.
        let samples = decode_samples(&full);
        assert!(samples.iter().tuple_windows().all(|(a, b)| a.0 < b.0));
        assert_eq!(samples, vec![(1, 1.0), (2, 222.0), (3, 3.0), (4, 4.0)]);
        Ok(())
    }

    #[test]
    fn consolidate_single_value() -> Result<()> {
        let op = MvccMergeOperator;
        let merged =
            op.full_merge(b"k", None, &[ts_operand(100, 10, &[(5, 5.0), (1, 1.0), (5, 50.0)])])?;
        assert_eq!(decode_samples(&merged), vec![(1, 1.0), (5, 50.0)]);
        Ok(())
    }

    #[test]
    fn merge_timestamp_adopted() -> Result<()> {
        let op = MvccMergeOperator;
        let merged = op.full_merge(b"k", None, &[ts_operand(100, 10, &[(1, 1.0)])])?;
        let meta = MVCCMetadata::decode(&merged)?;
        assert_eq!(meta.merge_timestamp, Some(Timestamp::new(1, 0)));
        Ok(())
    }
}
