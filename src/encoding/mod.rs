//! Binary data encodings.
//!
//! - mvcckey: the hand-rolled, order-aware encoding for MVCC sort keys.
//! - bincode: used for values (metadata, batch representations, SST runs).

pub mod bincode;
pub mod mvcckey;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Adds automatic Bincode encode/decode methods to value types. Values are
/// not order-sensitive, unlike MVCC sort keys, which use the mvcckey module.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value using Bincode.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes the value using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
