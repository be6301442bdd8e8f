//! Peer connection management.
//!
//! This module provides:
//! - Peer identification and per-peer protocol state
//! - The bounded advertised-tx set
//! - The per-peer read/write task

pub mod connection;
pub mod info;
pub mod txset;

pub use connection::{spawn_peer_connection, PeerCommand, PeerEvent};
pub use info::{ConnectionDirection, PeerId, PeerInfo};
pub use txset::TxFifoSet;
