//! # Sharepool P2P
//!
//! Peer protocol engine and coordinator for the sharepool share-chain node:
//!
//! - Framed, checksummed, magic-prefixed wire protocol with 13 message types
//! - Per-connection tasks handling framing, idle deadlines and keepalives
//! - Transaction inventory reconciliation (have/losing/forget/remember)
//! - Best-share announcement and share-request/reply exchange
//! - Gap-driven share-history backfill
//!
//! # Architecture
//!
//! Each connected peer runs in its own tokio task; the coordinator
//! ([`node::PoolNode`]) is a single select-loop task owning all shared state.
//! Communication between them is via channels.
//!
//! ```text
//! Coordinator Task (PoolNode::run())
//! ├── Listener (armed once the chain is calculatable)
//! ├── Peer Task 1 (framed read/write loop)
//! ├── Peer Task 2 (framed read/write loop)
//! └── Dial Tasks (outbound connects)
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;

pub mod manager;
pub mod node;
pub mod peer;
pub mod protocol;

// Re-export main types
pub use config::{P2pConfig, NETWORK_MAGIC, PROTOCOL_HEAD_LENGTH, PROTOCOL_VERSION};
pub use error::{P2pError, P2pResult};
pub use node::PoolNode;
pub use peer::{ConnectionDirection, PeerId, PeerInfo};
pub use protocol::{FrameCodec, Inbound, Message};
