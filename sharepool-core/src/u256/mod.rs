//! 256-bit unsigned integer arithmetic.
//!
//! Share requests carry a 256-bit identifier on the wire, little-endian.
//! Equality is by value.

// Allow clippy warnings from the uint crate's construct_uint macro
#![allow(clippy::manual_div_ceil)]
#![allow(clippy::assign_op_pattern)]

use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer.
    pub struct U256(4);
}

impl U256 {
    /// Decode from 32 little-endian bytes.
    #[inline]
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        U256::from_little_endian(bytes)
    }

    /// Encode to 32 little-endian bytes.
    #[inline]
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.to_little_endian(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_roundtrip() {
        let value = U256::from(0xdead_beef_u64) << 200;
        let bytes = value.to_le_bytes();
        assert_eq!(U256::from_le_bytes(&bytes), value);
    }

    #[test]
    fn test_le_layout() {
        let bytes = U256::from(1u64).to_le_bytes();
        assert_eq!(bytes[0], 1);
        assert!(bytes[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_equality_by_value() {
        assert_eq!(U256::from(42u64), U256::from(42u64));
        assert_ne!(U256::from(42u64), U256::from(43u64));
    }
}
