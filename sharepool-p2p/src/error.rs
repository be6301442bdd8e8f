//! P2P error types.

use std::io;
use thiserror::Error;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid network magic bytes.
    #[error("Bad magic number: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic {
        /// Magic we expect on this network.
        expected: [u8; 8],
        /// Magic actually received.
        actual: [u8; 8],
    },

    /// Payload checksum mismatch.
    #[error("Bad checksum: expected {expected:#010x}, got {actual:#010x}")]
    BadChecksum {
        /// Checksum declared in the frame head.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Payload exceeds the maximum allowed size.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Declared payload size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Payload bytes did not decode as the command's message type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The peer violated the protocol.
    #[error("Bad peer: {0}")]
    BadPeer(String),

    /// Peer not found in the connection registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A channel to another task was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<sharepool_core::CodecError> for P2pError {
    fn from(err: sharepool_core::CodecError) -> Self {
        P2pError::Decode(err.to_string())
    }
}

impl From<sharepool_core::SerializationError> for P2pError {
    fn from(err: sharepool_core::SerializationError) -> Self {
        P2pError::Decode(err.to_string())
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
