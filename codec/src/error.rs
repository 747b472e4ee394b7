//! Decoding failures.

use thiserror::Error;

/// Reasons a buffer could not be decoded.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("buffer ended before value was complete")]
    EndOfBuffer,
    #[error("{0} bytes left over after decoding")]
    ExtraData(usize),
    #[error("length {0} outside of allowed range")]
    InvalidLength(usize),
    #[error("malformed varint")]
    InvalidVarint,
    #[error("bool must be 0 or 1")]
    InvalidBool,
    /// A type-specific validation failed: `(type, reason)`.
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
}
