//! The MVCC data model.
//!
//! Each user key owns a series of rows in the underlying store, sorted so
//! that the newest data is found first:
//!
//! ```text
//! k <metadata>      timestampless row, only present for intents and inlines
//! k @ t3            committed (or provisional) value at t3
//! k @ t2
//! k @ t1
//! ```
//!
//! A metadata row carries an [`MVCCMetadata`] record. With a transaction
//! descriptor it is an intent: an uncommitted write whose provisional value
//! lives at the version row matching `meta.timestamp`. With inline raw bytes
//! and no transaction it is an inline value, read back as-is at any
//! timestamp, with no version rows at all. Intents and inlines are mutually
//! exclusive.
//!
//! Values stored at version rows (and carried in `raw_bytes`) use a small
//! envelope: a 4-byte checksum, a 1-byte tag, then the payload. The tag
//! distinguishes plain byte payloads from time series payloads, which get
//! special treatment during merges.

use crate::encoding::{self, bincode};
use crate::error::Result;
use crate::hlc::Timestamp;

use serde::{Deserialize, Serialize};

/// Size of the value envelope checksum.
pub const CHECKSUM_SIZE: usize = 4;
/// Position of the tag byte within the envelope.
pub const TAG_POS: usize = CHECKSUM_SIZE;
/// Total envelope header size.
pub const HEADER_SIZE: usize = TAG_POS + 1;

/// Tag for a value that could not be classified (e.g. one too short to have
/// a header).
pub const TAG_UNKNOWN: u8 = 0;
/// Tag for an opaque byte payload.
pub const TAG_BYTES: u8 = 3;
/// Tag for a payload holding [`TimeSeriesData`].
pub const TAG_TIMESERIES: u8 = 100;

/// A transaction descriptor, identifying the writer of an intent and, for
/// readers, the transaction on whose behalf a scan runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnMeta {
    /// The transaction ID. Opaque to the storage core; typically a UUID.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    /// The transaction epoch, incremented on each client-side retry. Writes
    /// from older epochs of the same transaction are ignored by readers.
    pub epoch: u32,
    /// The upper bound of the transaction's uncertainty window. Committed
    /// writes in (read timestamp, max_timestamp] force a restart.
    pub max_timestamp: Timestamp,
}

/// Metadata stored at a user key's timestampless row, and also the operand
/// format for engine-level merges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MVCCMetadata {
    /// The writing transaction, if this row is an intent.
    pub txn: Option<TxnMeta>,
    /// For an intent, the timestamp of the provisional version row. For an
    /// inline value, zero.
    pub timestamp: Timestamp,
    /// True if the newest version is a deletion tombstone.
    pub deleted: bool,
    /// Encoded key bytes charged for the newest version (always the version
    /// timestamp size; kept denormalized for statistics).
    pub key_bytes: u64,
    /// Value bytes of the newest version.
    pub val_bytes: u64,
    /// The inline value, if any. Also carries the payload of merge operands.
    #[serde(with = "serde_bytes")]
    pub raw_bytes: Option<Vec<u8>>,
    /// The timestamp of the latest merge folded into this row, if any.
    pub merge_timestamp: Option<Timestamp>,
}

impl encoding::Value for MVCCMetadata {}

impl MVCCMetadata {
    /// Returns true if this row holds an inline value.
    pub fn is_inline(&self) -> bool {
        self.raw_bytes.is_some() && self.txn.is_none()
    }
}

/// An intent encountered by a read: the key it covers and its metadata row.
/// Returned to callers so they can resolve the intent (by aborting or
/// waiting for the writer) and retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// The user key the intent covers.
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    /// The intent's metadata row, including the writer's descriptor.
    pub meta: MVCCMetadata,
}

/// A single sample in a time series payload. Samples at the same offset are
/// collapsed during merges, keeping the most recently written one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    /// The sample period, as an offset from the series start.
    pub offset: i32,
    /// Number of measurements aggregated into this sample.
    pub count: u32,
    /// Sum of the aggregated measurements.
    pub sum: f64,
    /// Largest aggregated measurement, if more than one.
    pub max: Option<f64>,
    /// Smallest aggregated measurement, if more than one.
    pub min: Option<f64>,
}

/// A time series payload: regularly spaced samples relative to a start time.
/// Samples are unordered at rest; consolidation sorts them by offset and
/// deduplicates, keeping the last sample written at each offset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesData {
    /// Start of the series, in nanoseconds.
    pub start_timestamp_nanos: i64,
    /// Width of each sample period, in nanoseconds.
    pub sample_duration_nanos: i64,
    /// The samples.
    pub samples: Vec<TimeSeriesSample>,
}

impl encoding::Value for TimeSeriesData {}

/// Returns the payload portion of a value envelope, or an empty slice if the
/// value is too short to carry a header.
pub fn value_payload(value: &[u8]) -> &[u8] {
    if value.len() < HEADER_SIZE {
        return &[];
    }
    &value[HEADER_SIZE..]
}

/// Returns the tag of a value envelope, or [`TAG_UNKNOWN`] if the value is
/// too short to carry a header.
pub fn value_tag(value: &[u8]) -> u8 {
    if value.len() < HEADER_SIZE {
        return TAG_UNKNOWN;
    }
    value[TAG_POS]
}

/// Returns true if the value envelope holds a time series payload.
pub fn is_time_series(value: &[u8]) -> bool {
    value_tag(value) == TAG_TIMESERIES
}

/// Builds a value envelope around a payload with a zeroed checksum. Callers
/// that persist the value directly should stamp it with [`init_checksum`].
pub fn make_value(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut value = vec![0; HEADER_SIZE];
    value[TAG_POS] = tag;
    value.extend_from_slice(payload);
    value
}

/// Parses the payload of a value envelope into a value type.
pub fn parse_value<T: encoding::Value>(value: &[u8]) -> Result<T> {
    if value.len() < HEADER_SIZE {
        return errcorrupt!("value of {} bytes is too short for an envelope", value.len());
    }
    bincode::deserialize(value_payload(value))
}

/// Serializes a value type into a fresh envelope with the given tag. The
/// checksum is zeroed.
pub fn serialize_value<T: encoding::Value>(tag: u8, payload: &T) -> Result<Vec<u8>> {
    Ok(make_value(tag, &bincode::serialize(payload)?))
}

/// Stamps a value envelope's checksum: a CRC-32 over the key, the tag, and
/// the payload. The key is included so a value cannot be silently moved to a
/// different key.
pub fn init_checksum(key: &[u8], value: &mut [u8]) {
    if value.len() < HEADER_SIZE {
        return;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(&value[TAG_POS..]);
    let sum = hasher.finalize().to_le_bytes();
    value[..CHECKSUM_SIZE].copy_from_slice(&sum);
}

/// Verifies a value envelope's checksum, if one was stamped. A zeroed
/// checksum means the value was produced by a merge and has not been
/// restamped; it verifies trivially.
pub fn verify_checksum(key: &[u8], value: &[u8]) -> Result<()> {
    if value.len() < HEADER_SIZE || value[..CHECKSUM_SIZE] == [0; CHECKSUM_SIZE] {
        return Ok(());
    }
    let mut expect = value.to_vec();
    init_checksum(key, &mut expect);
    if expect[..CHECKSUM_SIZE] != value[..CHECKSUM_SIZE] {
        return errcorrupt!("checksum mismatch for value at key {key:x?}");
    }
    Ok(())
}
