//! Error types for the sharepool core crate.

use std::fmt;

/// Errors related to serialization and deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationError {
    /// Failed to encode data to bytes.
    EncodeFailed(String),
    /// Failed to decode data from bytes.
    DecodeFailed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::EncodeFailed(msg) => write!(f, "encode failed: {}", msg),
            SerializationError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SerializationError {}

/// Errors from fixed-layout binary codecs (block headers, share wrappers).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the structure was complete.
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// A version or variant tag was not recognised.
    UnknownVersion(u64),
    /// Wrapped contents failed to decode.
    BadContents(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, available } => {
                write!(f, "truncated input: needed {} bytes, had {}", needed, available)
            }
            CodecError::UnknownVersion(v) => write!(f, "unknown version tag: {}", v),
            CodecError::BadContents(msg) => write!(f, "bad contents: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<SerializationError> for CodecError {
    fn from(e: SerializationError) -> Self {
        CodecError::BadContents(e.to_string())
    }
}
