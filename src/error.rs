use crate::hlc::Timestamp;
use crate::storage::mvcc::Intent;

use serde::{Deserialize, Serialize};

/// strata errors. Errors are considered permanent for the operation that
/// produced them: the storage core never retries internally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid stored data: undecodable keys, unparseable metadata, or
    /// mismatched merge envelopes. Not recoverable.
    Corruption(String),
    /// A transaction read its own intent, but the intent was written at a
    /// newer epoch. The earlier incarnation of the transaction must abort.
    EpochMismatch { read_epoch: u32, intent_epoch: u32 },
    /// An unexpected internal state, typically an invariant violation.
    Internal(String),
    /// Invalid user input or configuration.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A reading transaction observed a committed version inside its
    /// uncertainty window. Carries the timestamp of the offending version;
    /// the transaction must restart above it.
    Uncertainty(Timestamp),
    /// The operation is not supported by this engine backing.
    Unsupported(String),
    /// A consistent read encountered intents written by other transactions.
    /// The intents must be resolved before the read can succeed.
    WriteIntent(Vec<Intent>),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::EpochMismatch { read_epoch, intent_epoch } => write!(
                f,
                "failed to read with epoch {read_epoch} due to a write intent with epoch {intent_epoch}"
            ),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Uncertainty(ts) => {
                write!(f, "read is uncertain below a committed write at {ts}")
            }
            Error::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Error::WriteIntent(intents) => {
                write!(f, "conflicting intents on {} keys", intents.len())
            }
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::Unsupported for the given format string.
#[macro_export]
macro_rules! errunsupported {
    ($($args:tt)*) => { $crate::error::Error::Unsupported(format!($($args)*)).into() };
}

/// A strata Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
