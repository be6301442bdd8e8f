//! Deterministic binary serialization for share contents.
//!
//! Shares travelling inside the `shares` wire container are serialized with
//! bincode under a deterministic configuration: fixed-size integers,
//! little-endian byte order, trailing bytes rejected on decode. The same
//! input always produces the same output on every platform.

mod bincode_config;

pub use bincode_config::{deserialize, serialize};
