//! Peer identification and per-peer protocol state.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use sharepool_core::{TransactionTemplate, ZERO_HASH};

use crate::config::CAPABILITY_PREFIX;
use crate::peer::txset::TxFifoSet;
use crate::protocol::VersionMessage;

/// Unique identifier for a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Create a new peer ID from a counter value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// State the coordinator keeps for one connected peer.
#[derive(Debug)]
pub struct PeerInfo {
    /// Unique peer identifier for this session.
    pub id: PeerId,
    /// Socket address of the peer.
    pub addr: SocketAddr,
    /// Direction of the connection.
    pub direction: ConnectionDirection,
    /// Peer's sub-version string (set after handshake).
    pub sub_version: Option<String>,
    /// Whether the sub-version grants the larger request/reply bounds.
    pub is_js2pool: bool,
    /// The peer's advertised share-chain tip.
    pub best_share_hash: [u8; 32],
    /// Our own address as the peer reported it in `address_to`.
    pub external_address: Option<IpAddr>,
    /// Our own port as the peer reported it.
    pub external_port: Option<u16>,
    /// Tx hashes the peer advertised via `have_tx` (bounded FIFO).
    pub remote_tx_hashes: TxFifoSet,
    /// Txs the peer asked us to remember for share resolution.
    pub remembered_txs: HashMap<[u8; 32], TransactionTemplate>,
    /// When the connection was established.
    pub connected_at: Instant,
}

impl PeerInfo {
    /// Create state for a new peer connection.
    pub fn new(id: PeerId, addr: SocketAddr, direction: ConnectionDirection) -> Self {
        Self {
            id,
            addr,
            direction,
            sub_version: None,
            is_js2pool: false,
            best_share_hash: ZERO_HASH,
            external_address: None,
            external_port: None,
            remote_tx_hashes: TxFifoSet::new(),
            remembered_txs: HashMap::new(),
            connected_at: Instant::now(),
        }
    }

    /// Record handshake data from the peer's `version` message.
    pub fn complete_handshake(&mut self, version: &VersionMessage) {
        self.is_js2pool = version.sub_version.starts_with(CAPABILITY_PREFIX);
        self.sub_version = Some(version.sub_version.clone());
        self.best_share_hash = version.best_share_hash;
        self.external_address = Some(version.address_to.ip);
        self.external_port = Some(version.address_to.port);
    }

    /// Whether the handshake has completed.
    pub fn handshaked(&self) -> bool {
        self.sub_version.is_some()
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, agent={})",
            self.id,
            self.addr,
            self.direction,
            self.sub_version.as_deref().unwrap_or("?")
        )
    }
}
