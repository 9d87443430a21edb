#![warn(clippy::all)]
#![allow(clippy::module_inception)]

#[macro_use]
pub mod error;

pub mod encoding;
pub mod hlc;
pub mod keys;
pub mod storage;

pub use error::{Error, Result};
pub use hlc::Timestamp;
