//! Cryptographic primitives.

mod hashing;

pub use hashing::{sha256, sha256d, to_hex};
