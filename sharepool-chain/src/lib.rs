//! # Sharepool Chain
//!
//! In-memory share-chain store: a dual-indexed database of shares keyed by
//! hash and by absolute height, tracking orphans, dead shares and gaps across
//! a bounded sliding window.
//!
//! The store is synchronous and single-owner. Mutating calls queue typed
//! events ([`events::ChainEvent`]) which the owner drains with
//! [`store::ShareChain::take_events`] before its next suspension point, so
//! observers always see a consistent snapshot.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod events;
pub mod store;

pub use events::{ChainEvent, Gap};
pub use store::{Direction, ShareChain, BASE_CHAIN_LENGTH, MAX_CHAIN_LENGTH};
