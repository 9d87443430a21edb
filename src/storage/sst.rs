//! SST run writing and ingestion glue. An [`SstWriter`] builds a serialized
//! run of encoded key/value pairs in comparator order, collecting time-bound
//! properties as it goes. The resulting bytes can be placed in a store's
//! environment (e.g. via `env_write_file`) and installed atomically with
//! `ingest_file`, which is how bulk loads and snapshot application move data
//! without writing through the memtable.

use super::timebound::{TimeBoundCollector, TimeBounds};
use crate::encoding::mvcckey::{compare, encode_key};
use crate::encoding::{self, Value as _};
use crate::error::Result;
use crate::hlc::Timestamp;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The serialized form of an SST run: its entries in comparator order, plus
/// the collected time-bound properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(super) struct SstFile {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub bounds: TimeBounds,
}

impl encoding::Value for SstFile {}

/// Writes an SST run. Keys must be added in strictly ascending comparator
/// order.
#[derive(Default)]
pub struct SstWriter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    collector: TimeBoundCollector,
}

impl SstWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key/value pair. The MVCC key must sort strictly after all
    /// previously added keys.
    pub fn put(&mut self, key: &[u8], ts: Timestamp, value: &[u8]) -> Result<()> {
        let encoded = encode_key(key, ts);
        if let Some((last, _)) = self.entries.last() {
            if compare(&encoded, last) != Ordering::Greater {
                return errinput!("keys must be added in strictly ascending order");
            }
        }
        self.collector.add(&encoded);
        self.entries.push((encoded, value.to_vec()));
        Ok(())
    }

    /// The number of entries added so far.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Finishes the run and returns its serialized bytes. Fails on an empty
    /// run, which cannot be ingested.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.entries.is_empty() {
            return errinput!("cannot finish an sst run with no entries");
        }
        SstFile { entries: self.entries, bounds: self.collector.finish() }.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Value as _;
    use crate::error::Error;

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    #[test]
    fn writes_sorted_run() -> Result<()> {
        let mut writer = SstWriter::new();
        // MVCC order: newer versions of a key come before older ones.
        writer.put(b"a", ts(5), b"a5")?;
        writer.put(b"a", ts(3), b"a3")?;
        writer.put(b"b", ts(4), b"b4")?;
        assert_eq!(writer.count(), 3);

        let file = SstFile::decode(&writer.finish()?)?;
        assert_eq!(file.entries.len(), 3);
        assert_eq!(file.bounds.min_timestamp()?, Some(ts(3)));
        assert_eq!(file.bounds.max_timestamp()?, Some(ts(5)));
        Ok(())
    }

    #[test]
    fn rejects_out_of_order_keys() -> Result<()> {
        let mut writer = SstWriter::new();
        writer.put(b"b", ts(1), b"v")?;
        assert!(matches!(writer.put(b"a", ts(1), b"v"), Err(Error::InvalidInput(_))));
        // An older version of the same key is in order; a newer one is not.
        let mut writer = SstWriter::new();
        writer.put(b"a", ts(3), b"v")?;
        writer.put(b"a", ts(2), b"v")?;
        assert!(matches!(writer.put(b"a", ts(4), b"v"), Err(Error::InvalidInput(_))));
        assert!(matches!(writer.put(b"a", ts(2), b"v"), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn rejects_empty_run() {
        assert!(matches!(SstWriter::new().finish(), Err(Error::InvalidInput(_))));
    }
}
