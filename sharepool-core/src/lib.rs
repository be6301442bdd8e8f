//! # Sharepool Core
//!
//! Core types and primitives for the sharepool share-chain protocol.
//!
//! This crate provides the foundation for the chain and p2p crates:
//! - SHA-256 / double-SHA-256 hashing
//! - Share structures and their on-wire wrapper
//! - Transaction templates (the pool's view of pending blockchain txs)
//! - Block header codec for the `bestblock` message
//! - 256-bit arithmetic for wire-carried request ids
//! - Deterministic binary serialization

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
pub mod crypto;
pub mod error;
pub mod serialization;
pub mod share;
pub mod transaction;
pub mod u256;

// Re-export commonly used types at crate root
pub use block::BlockHeader;
pub use crypto::{sha256, sha256d, to_hex};
pub use error::{CodecError, SerializationError};
pub use share::{Share, ShareData, ShareInfo, WrappedShare, ZERO_HASH};
pub use transaction::{BlockTemplate, TransactionTemplate};
pub use u256::U256;
