//! Upstream block header codec.
//!
//! The `bestblock` message carries a serialized header of the chain being
//! mined. The layout is the classic 80-byte little-endian header.

use crate::crypto::sha256d;
use crate::error::CodecError;

/// Serialized header length in bytes.
pub const HEADER_LENGTH: usize = 80;

/// An upstream blockchain block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Header version.
    pub version: u32,
    /// Hash of the previous block header.
    pub previous_block_hash: [u8; 32],
    /// Merkle root of the block's transactions.
    pub merkle_root: [u8; 32],
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Decode a header from exactly 80 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(CodecError::Truncated {
                needed: HEADER_LENGTH,
                available: bytes.len(),
            });
        }

        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);

        Ok(Self {
            version: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            previous_block_hash: prev,
            merkle_root: merkle,
            timestamp: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            bits: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(bytes[76..80].try_into().unwrap()),
        })
    }

    /// Encode to the 80-byte wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.previous_block_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Compute the block hash (double SHA-256 of the encoded header).
    pub fn hash(&self) -> [u8; 32] {
        sha256d(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> BlockHeader {
        BlockHeader {
            version: 0x2000_0000,
            previous_block_hash: [0xAB; 32],
            merkle_root: [0xCD; 32],
            timestamp: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 12345,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let header = test_header();
        let bytes = header.encode();

        assert_eq!(bytes.len(), HEADER_LENGTH);
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_decode_truncated() {
        let result = BlockHeader::decode(&[0u8; 79]);
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_hash_determinism() {
        let header = test_header();
        assert_eq!(header.hash(), header.hash());

        let mut other = test_header();
        other.nonce += 1;
        assert_ne!(header.hash(), other.hash());
    }
}
