use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Reftable errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Malformed block or record bytes, typically a truncated record or an
    /// impossible length field.
    Format(String),
    /// Magic or checksum mismatch. The table is unusable.
    Integrity(String),
    /// An IO error from the underlying block source or output sink.
    IO(String),
    /// The caller broke an ordering, section, or naming rule. A writer that
    /// reported this has not sealed a table and its output must be discarded.
    Contract(String),
    /// The configured block size cannot hold some record. Carries the
    /// smallest block size that would.
    BlockSizeTooSmall { required: usize },
    /// An annotated-tag ref was written without its peeled object id.
    PeeledRefRequired(String),
    /// The operation is meaningless for this cursor.
    Unsupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "malformed table data: {msg}"),
            Error::Integrity(msg) => write!(f, "integrity check failed: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Contract(msg) => write!(f, "contract violation: {msg}"),
            Error::BlockSizeTooSmall { required } => {
                write!(f, "block size too small, need at least {required} bytes")
            }
            Error::PeeledRefRequired(name) => {
                write!(f, "annotated tag {name} requires a peeled id")
            }
            Error::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
        }
    }
}

/// Constructs an Error::Format for the given format string.
#[macro_export]
macro_rules! errformat {
    ($($args:tt)*) => { $crate::error::Error::Format(format!($($args)*)).into() };
}

/// Constructs an Error::Contract for the given format string.
#[macro_export]
macro_rules! errcontract {
    ($($args:tt)*) => { $crate::error::Error::Contract(format!($($args)*)).into() };
}

/// A reftable Result returning Error.
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

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
