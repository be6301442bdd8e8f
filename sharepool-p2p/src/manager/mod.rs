//! Peer manager.
//!
//! Tracks connection slots, owns the command channels to peer tasks, and
//! routes outbound messages. All outbound operations go over unbounded
//! channels and never block; callers may fire-and-forget.

pub mod slots;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::error::{P2pError, P2pResult};
use crate::peer::{PeerCommand, PeerId, PeerInfo};
use crate::protocol::Message;

pub use slots::ConnectionSlots;

/// Manages all peer connections.
pub struct PeerManager {
    /// Connection slot tracking.
    slots: ConnectionSlots,
    /// Command channels to each peer task.
    peer_commands: HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>,
    /// Next peer ID counter.
    next_peer_id: u64,
}

impl PeerManager {
    /// Create a new peer manager with the given connection limit.
    pub fn new(max_conn: usize) -> Self {
        Self {
            slots: ConnectionSlots::new(max_conn),
            peer_commands: HashMap::new(),
            next_peer_id: 1,
        }
    }

    /// Allocate a new peer ID.
    pub fn next_peer_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        PeerId::new(id)
    }

    /// Whether a new connection fits under the limit.
    pub fn can_accept(&self) -> bool {
        self.slots.can_accept()
    }

    /// Whether we should dial an address.
    pub fn should_connect(&self, addr: &SocketAddr) -> bool {
        self.slots.should_connect(addr)
    }

    /// Mark an address as being dialed.
    pub fn start_connecting(&mut self, addr: SocketAddr) {
        self.slots.start_connecting(addr);
    }

    /// Clear an address from the dialing set.
    pub fn stop_connecting(&mut self, addr: &SocketAddr) {
        self.slots.stop_connecting(addr);
    }

    /// Register a connected peer.
    pub fn add_peer(&mut self, info: PeerInfo, command_tx: mpsc::UnboundedSender<PeerCommand>) {
        let peer_id = info.id;
        self.slots.add_peer(info);
        self.peer_commands.insert(peer_id, command_tx);
    }

    /// Remove a peer, returning its state.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peer_commands.remove(peer_id);
        self.slots.remove_peer(peer_id)
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.slots.get_peer(peer_id)
    }

    /// Get a mutable reference to a peer.
    pub fn get_peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerInfo> {
        self.slots.get_peer_mut(peer_id)
    }

    /// Send a message to a specific peer.
    pub fn send_to_peer(&self, peer_id: &PeerId, message: Message) -> P2pResult<()> {
        let tx = self
            .peer_commands
            .get(peer_id)
            .ok_or_else(|| P2pError::PeerNotFound(peer_id.to_string()))?;

        tx.send(PeerCommand::Send(message))
            .map_err(|_| P2pError::ChannelClosed("peer command channel".to_string()))
    }

    /// Send a message to all connected peers.
    pub fn broadcast(&self, message: Message) {
        for (peer_id, tx) in &self.peer_commands {
            if tx.send(PeerCommand::Send(message.clone())).is_err() {
                tracing::debug!(peer = %peer_id, "Failed to broadcast to peer");
            }
        }
    }

    /// Send a message to all peers except one.
    pub fn broadcast_except(&self, message: Message, exclude: &PeerId) {
        for (peer_id, tx) in &self.peer_commands {
            if peer_id != exclude && tx.send(PeerCommand::Send(message.clone())).is_err() {
                tracing::debug!(peer = %peer_id, "Failed to broadcast to peer");
            }
        }
    }

    /// Ask a peer task to close its link.
    pub fn disconnect_peer(&self, peer_id: &PeerId) -> P2pResult<()> {
        let tx = self
            .peer_commands
            .get(peer_id)
            .ok_or_else(|| P2pError::PeerNotFound(peer_id.to_string()))?;

        tx.send(PeerCommand::Disconnect)
            .map_err(|_| P2pError::ChannelClosed("peer command channel".to_string()))
    }

    /// All connected peer IDs.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.slots.peer_ids()
    }

    /// Peer IDs ordered capable-first, for share-request fan-out.
    pub fn peers_js2pool_first(&self) -> Vec<PeerId> {
        let mut ids: Vec<(bool, PeerId)> = self
            .slots
            .iter()
            .map(|info| (info.is_js2pool, info.id))
            .collect();
        ids.sort_by_key(|(capable, _)| !*capable);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Total connection count.
    pub fn count(&self) -> usize {
        self.slots.count()
    }

    /// Iterate over all peers.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ConnectionDirection;

    fn make_peer(id: u64, addr: &str) -> PeerInfo {
        PeerInfo::new(PeerId::new(id), addr.parse().unwrap(), ConnectionDirection::Inbound)
    }

    #[test]
    fn test_add_send_remove() {
        let mut manager = PeerManager::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = make_peer(1, "127.0.0.1:9333");
        let peer_id = peer.id;

        manager.add_peer(peer, tx);
        manager.send_to_peer(&peer_id, Message::Ping).unwrap();
        assert!(matches!(rx.try_recv(), Ok(PeerCommand::Send(Message::Ping))));

        manager.remove_peer(&peer_id);
        assert!(manager.send_to_peer(&peer_id, Message::Ping).is_err());
    }

    #[test]
    fn test_broadcast_except() {
        let mut manager = PeerManager::new(8);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let p1 = make_peer(1, "127.0.0.1:9333");
        let p2 = make_peer(2, "127.0.0.2:9333");
        let exclude = p1.id;

        manager.add_peer(p1, tx1);
        manager.add_peer(p2, tx2);

        manager.broadcast_except(Message::Pong, &exclude);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(PeerCommand::Send(Message::Pong))));
    }

    #[test]
    fn test_js2pool_first_ordering() {
        let mut manager = PeerManager::new(8);
        for (id, capable) in [(1u64, false), (2, true), (3, false), (4, true)] {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut peer = make_peer(id, &format!("127.0.0.{}:9333", id));
            peer.is_js2pool = capable;
            manager.add_peer(peer, tx);
        }

        let ordered = manager.peers_js2pool_first();
        let capable_count = ordered
            .iter()
            .take(2)
            .filter(|id| manager.get_peer(id).unwrap().is_js2pool)
            .count();
        assert_eq!(capable_count, 2, "capable peers sort first");
    }
}
