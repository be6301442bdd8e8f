//! Pool node coordinator.
//!
//! One task owns every piece of shared state: the chain store handle, the
//! known/mining transaction views, pending share requests and the peer
//! registry. Peer tasks deliver decoded messages over a channel; all protocol
//! reactions, view diffs and chain-event handling run inside this task's
//! select loop before its next suspension point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use sharepool_chain::{ChainEvent, Direction, Gap, ShareChain};
use sharepool_core::{
    sha256, to_hex, BlockTemplate, Share, TransactionTemplate, WrappedShare, U256, ZERO_HASH,
};

use crate::config::{
    P2pConfig, GAP_PARENTS_LIMIT, GAP_PARENTS_LIMIT_LEGACY, GAP_REQUEST_FANOUT,
    KNOWN_TXS_CACHE_DEPTH, PROTOCOL_VERSION, REMOTE_TX_SET_LIMIT, REPLY_PARENTS_LIMIT,
    REPLY_PARENTS_LIMIT_LEGACY, REPLY_SHARE_BUDGET,
};
use crate::error::P2pResult;
use crate::manager::PeerManager;
use crate::peer::{spawn_peer_connection, ConnectionDirection, PeerEvent, PeerId, PeerInfo};
use crate::protocol::{
    reply_result, AddressEntry, Message, PeerAddress, ShareReplyMessage, ShareReqMessage,
    VersionMessage,
};

/// Outcome of an outbound dial, delivered back to the coordinator loop.
struct DialResult {
    addr: SocketAddr,
    stream: std::io::Result<TcpStream>,
}

/// Transaction-map lookup honouring the txid-or-hash convention.
fn lookup<'a>(
    map: &'a HashMap<[u8; 32], TransactionTemplate>,
    key: &[u8; 32],
) -> Option<&'a TransactionTemplate> {
    map.get(key).or_else(|| map.values().find(|t| t.hash == *key))
}

/// Pending-request dedupe key for a gap.
fn gap_key(gap: &Gap) -> [u8; 32] {
    sha256(format!("{}-{}", to_hex(&gap.descendent), gap.length).as_bytes())
}

fn random_u256() -> U256 {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    U256::from_le_bytes(&bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resolution of a share's newly-referenced transaction hash.
enum TxResolution {
    /// Found a full template.
    Resolved(TransactionTemplate),
    /// Known by reference only; nothing to accumulate.
    Skip,
    /// Nowhere to be found.
    Unknown,
}

/// The pool node.
pub struct PoolNode {
    /// P2P configuration.
    config: Arc<P2pConfig>,
    /// The share-chain store; written only from this task.
    chain: Arc<RwLock<ShareChain>>,
    /// Peer registry and command channels.
    peers: PeerManager,
    /// Transactions this node is willing to describe to peers.
    known_txs: HashMap<[u8; 32], TransactionTemplate>,
    /// Transactions in the current mining template.
    mining_txs: HashMap<[u8; 32], TransactionTemplate>,
    /// Removed sets of previous known-tx snapshots, oldest first.
    known_txs_caches: VecDeque<HashMap<[u8; 32], TransactionTemplate>>,
    /// Outstanding share requests: request id to gap dedupe key.
    pending_share_requests: HashMap<U256, [u8; 32]>,
    /// Set once the chain becomes calculatable; arms the listener.
    listen_requested: bool,
    /// Our connection nonce.
    nonce: u64,
    /// Shutdown signal.
    shutdown_rx: Option<mpsc::Receiver<()>>,
    shutdown_tx: mpsc::Sender<()>,
    /// Reports the bound listen address once the listener is armed.
    bound_addr_tx: Option<oneshot::Sender<SocketAddr>>,
    /// Fire-and-forget share archive.
    save_tx: Option<mpsc::UnboundedSender<Vec<Share>>>,
    /// Mining-template feed.
    template_rx: Option<mpsc::Receiver<BlockTemplate>>,
    /// JoinHandles for peer tasks (graceful shutdown).
    peer_tasks: HashMap<PeerId, JoinHandle<()>>,
}

impl PoolNode {
    /// Create a new pool node over a chain store handle.
    pub fn new(config: P2pConfig, chain: Arc<RwLock<ShareChain>>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let max_conn = config.max_conn;

        Self {
            config: Arc::new(config),
            chain,
            peers: PeerManager::new(max_conn),
            known_txs: HashMap::new(),
            mining_txs: HashMap::new(),
            known_txs_caches: VecDeque::new(),
            pending_share_requests: HashMap::new(),
            listen_requested: false,
            nonce: rand::random(),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx,
            bound_addr_tx: None,
            save_tx: None,
            template_rx: None,
            peer_tasks: HashMap::new(),
        }
    }

    /// Get a receiver for the bound listen address.
    ///
    /// Fires once the chain becomes calculatable and the listener is armed.
    /// Useful for tests binding port 0.
    pub fn bound_addr_receiver(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.bound_addr_tx = Some(tx);
        rx
    }

    /// Get a receiver for archived share batches.
    ///
    /// Every batch ingested from a share reply is sent here for durable
    /// archival; the channel is fire-and-forget.
    pub fn share_archive_receiver(&mut self) -> mpsc::UnboundedReceiver<Vec<Share>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.save_tx = Some(tx);
        rx
    }

    /// Get a sender for pushing fresh mining templates into the node.
    pub fn template_sender(&mut self) -> mpsc::Sender<BlockTemplate> {
        let (tx, rx) = mpsc::channel(4);
        self.template_rx = Some(rx);
        tx
    }

    /// Get the shutdown sender for external shutdown signals.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the pool node.
    pub async fn run(mut self) -> P2pResult<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<PeerEvent>(256);
        let (dial_tx, mut dial_rx) = mpsc::channel::<DialResult>(64);

        let mut shutdown_rx = self.shutdown_rx.take().unwrap();
        let mut template_rx = self.template_rx.take();

        // The listener is armed only once the chain is calculatable; a chain
        // restored from the archive may already be there.
        self.listen_requested = self.chain.read().await.is_calculatable();
        let mut listener: Option<TcpListener> = None;

        self.init_peers(self.config.peers.clone(), &dial_tx);

        loop {
            if self.listen_requested && listener.is_none() {
                // Bind failure is fatal to the node.
                let bound = TcpListener::bind(self.config.bind_addr).await?;
                let local_addr = bound.local_addr()?;
                tracing::info!(addr = %local_addr, "Pool node listening");
                if let Some(tx) = self.bound_addr_tx.take() {
                    let _ = tx.send(local_addr);
                }
                listener = Some(bound);
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Pool node shutting down");
                    self.shutdown_peers().await;
                    break;
                }

                // Accept inbound connections once listening.
                result = async {
                    match listener.as_ref() {
                        Some(l) => l.accept().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match result {
                        Ok((stream, addr)) => self.handle_accept(stream, addr, &event_tx).await,
                        Err(e) => tracing::warn!(error = %e, "Accept error"),
                    }
                }

                Some(result) = dial_rx.recv() => {
                    self.handle_dial_result(result, &event_tx).await;
                }

                Some(event) = event_rx.recv() => {
                    self.handle_peer_event(event).await;
                }

                Some(template) = async {
                    match template_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.update_mining_template(template);
                }
            }
        }

        Ok(())
    }

    /// Dial the supplied peer addresses.
    fn init_peers(&mut self, addrs: Vec<SocketAddr>, dial_tx: &mpsc::Sender<DialResult>) {
        for addr in addrs {
            if !self.peers.should_connect(&addr) {
                continue;
            }
            self.peers.start_connecting(addr);

            let connect_timeout = self.config.connect_timeout;
            let dial_tx = dial_tx.clone();
            tokio::spawn(async move {
                let stream =
                    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                        Ok(result) => result,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect timeout",
                        )),
                    };
                let _ = dial_tx.send(DialResult { addr, stream }).await;
            });
        }
    }

    /// Register an accepted inbound connection.
    async fn handle_accept(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) {
        if !self.peers.can_accept() {
            tracing::debug!(addr = %addr, "Rejecting inbound: no slots");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let peer_id = self.peers.next_peer_id();
        let (command_tx, handle) =
            spawn_peer_connection(peer_id, addr, stream, event_tx.clone(), self.config.clone());

        let info = PeerInfo::new(peer_id, addr, ConnectionDirection::Inbound);
        self.peers.add_peer(info, command_tx);
        self.peer_tasks.insert(peer_id, handle);
        tracing::debug!(peer = %peer_id, addr = %addr, "Accepted inbound");

        self.send_version(peer_id).await;
    }

    /// Register a completed outbound dial.
    async fn handle_dial_result(&mut self, result: DialResult, event_tx: &mpsc::Sender<PeerEvent>) {
        self.peers.stop_connecting(&result.addr);

        let stream = match result.stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(addr = %result.addr, error = %e, "Outbound connection failed");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let peer_id = self.peers.next_peer_id();
        let (command_tx, handle) = spawn_peer_connection(
            peer_id,
            result.addr,
            stream,
            event_tx.clone(),
            self.config.clone(),
        );

        let info = PeerInfo::new(peer_id, result.addr, ConnectionDirection::Outbound);
        self.peers.add_peer(info, command_tx);
        self.peer_tasks.insert(peer_id, handle);
        tracing::debug!(peer = %peer_id, addr = %result.addr, "Outbound connection established");

        self.send_version(peer_id).await;
    }

    /// Send our `version` to a peer.
    async fn send_version(&mut self, peer_id: PeerId) {
        let Some(info) = self.peers.get_peer(&peer_id) else {
            return;
        };
        let peer_addr = info.addr;

        let best_share_hash = self
            .chain
            .read()
            .await
            .newest()
            .map_or(ZERO_HASH, |(_, hash)| hash);

        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            address_to: PeerAddress {
                services: 0,
                ip: peer_addr.ip(),
                port: peer_addr.port(),
            },
            address_from: PeerAddress {
                services: 0,
                ip: self.config.bind_addr.ip(),
                port: self.config.bind_addr.port(),
            },
            nonce: self.nonce,
            sub_version: self.config.sub_version.clone(),
            best_share_hash,
        };

        let _ = self.peers.send_to_peer(&peer_id, Message::Version(version));
    }

    /// Handle a peer event.
    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer_id, message } => {
                self.handle_message(peer_id, *message).await;
            }
            PeerEvent::Disconnected { peer_id, reason } => {
                tracing::info!(peer = %peer_id, reason = %reason, "Peer disconnected");
                self.peers.remove_peer(&peer_id);
                self.peer_tasks.remove(&peer_id);
            }
        }
    }

    /// Protocol violation: log, close the link.
    fn bad_peer(&mut self, peer_id: PeerId, reason: &str) {
        tracing::warn!(peer = %peer_id, reason, "Bad peer");
        let _ = self.peers.disconnect_peer(&peer_id);
    }

    /// Dispatch a decoded message.
    async fn handle_message(&mut self, peer_id: PeerId, message: Message) {
        match message {
            Message::Version(version) => self.handle_version(peer_id, version).await,
            // Keepalives are answered on the connection task.
            Message::Ping | Message::Pong => {}
            Message::Addrs(entries) => {
                tracing::debug!(peer = %peer_id, count = entries.len(), "Peer addresses received");
            }
            Message::AddrMe(port) => self.handle_addr_me(peer_id, port),
            Message::GetAddrs { count } => self.handle_get_addrs(peer_id, count),
            Message::HaveTx(hashes) => self.handle_have_tx(peer_id, hashes),
            Message::LosingTx(hashes) => self.handle_losing_tx(peer_id, hashes),
            Message::ForgetTx { tx_hashes, .. } => self.handle_forget_tx(peer_id, tx_hashes),
            Message::RememberTx { tx_hashes, txs } => {
                self.handle_remember_tx(peer_id, tx_hashes, txs)
            }
            Message::BestBlock(header) => {
                tracing::debug!(
                    peer = %peer_id,
                    hash = %to_hex(&header.hash()),
                    "Best block announced"
                );
            }
            Message::Shares(shares) => self.handle_shares(peer_id, shares).await,
            Message::ShareReq(request) => self.handle_share_req(peer_id, request).await,
            Message::ShareReply(reply) => self.handle_share_reply(peer_id, reply).await,
        }
    }

    /// Handshake reaction: record peer state, send our inventory and mining
    /// set, and request the peer's best share if we lack it.
    async fn handle_version(&mut self, peer_id: PeerId, version: VersionMessage) {
        let Some(info) = self.peers.get_peer_mut(&peer_id) else {
            return;
        };
        info.complete_handshake(&version);
        tracing::info!(
            peer = %peer_id,
            agent = %version.sub_version,
            js2pool = info.is_js2pool,
            "Peer handshake complete"
        );

        let inventory: Vec<[u8; 32]> = self.known_txs.keys().copied().collect();
        let _ = self.peers.send_to_peer(&peer_id, Message::HaveTx(inventory));

        let mining: Vec<TransactionTemplate> = self.mining_txs.values().cloned().collect();
        let remember = self.build_remember_tx(&peer_id, &mining);
        let _ = self.peers.send_to_peer(&peer_id, remember);

        // Loose-equality quirk preserved: a zero best-share hash means the
        // peer has no tip, and nothing is requested.
        if version.best_share_hash != ZERO_HASH
            && !self.chain.read().await.contains(&version.best_share_hash)
        {
            let request = ShareReqMessage {
                id: random_u256(),
                hashes: vec![version.best_share_hash],
                parents: 1,
                stops: Vec::new(),
            };
            let _ = self
                .peers
                .send_to_peer(&peer_id, Message::ShareReq(request));
        }
    }

    /// Partition templates against what the peer already advertised:
    /// advertised ones travel by hash, the rest inline.
    fn build_remember_tx(&self, peer_id: &PeerId, templates: &[TransactionTemplate]) -> Message {
        let mut tx_hashes = Vec::new();
        let mut txs = Vec::new();

        let advertised = self.peers.get_peer(peer_id).map(|p| &p.remote_tx_hashes);
        for template in templates {
            let known_remotely = advertised.map_or(false, |set| {
                set.contains(&template.txid) || set.contains(&template.hash)
            });
            if known_remotely {
                tx_hashes.push(template.txid);
            } else {
                txs.push(template.data.clone());
            }
        }

        Message::RememberTx { tx_hashes, txs }
    }

    fn handle_addr_me(&mut self, peer_id: PeerId, port: u16) {
        let Some(info) = self.peers.get_peer(&peer_id) else {
            return;
        };
        if info.addr.port() != port {
            self.bad_peer(peer_id, "ports are not equal");
        } else {
            tracing::debug!(peer = %peer_id, port, "Peer confirmed its port");
        }
    }

    /// Answer with the addresses of currently connected peers.
    fn handle_get_addrs(&mut self, peer_id: PeerId, count: u32) {
        let now = unix_now();
        let entries: Vec<AddressEntry> = self
            .peers
            .peers()
            .filter(|info| info.id != peer_id)
            .take(count as usize)
            .map(|info| AddressEntry {
                timestamp: now,
                address: PeerAddress {
                    services: 0,
                    ip: info.addr.ip(),
                    port: info.addr.port(),
                },
            })
            .collect();

        let _ = self.peers.send_to_peer(&peer_id, Message::Addrs(entries));
    }

    /// Record advertised txs into the peer's bounded FIFO set.
    ///
    /// Eviction runs before insertion, so the incoming batch itself can push
    /// the set above the cap until the next message.
    fn handle_have_tx(&mut self, peer_id: PeerId, hashes: Vec<[u8; 32]>) {
        if let Some(info) = self.peers.get_peer_mut(&peer_id) {
            info.remote_tx_hashes.evict_down_to(REMOTE_TX_SET_LIMIT);
            for hash in hashes {
                info.remote_tx_hashes.insert(hash);
            }
        }
    }

    fn handle_losing_tx(&mut self, peer_id: PeerId, hashes: Vec<[u8; 32]>) {
        if let Some(info) = self.peers.get_peer_mut(&peer_id) {
            for hash in &hashes {
                info.remote_tx_hashes.remove(hash);
            }
        }
    }

    /// The peer no longer needs these remembered for share resolution.
    fn handle_forget_tx(&mut self, peer_id: PeerId, hashes: Vec<[u8; 32]>) {
        if let Some(info) = self.peers.get_peer_mut(&peer_id) {
            for hash in &hashes {
                info.remembered_txs.remove(hash);
            }
        }
    }

    /// Record txs the peer asks us to retain: references resolve against the
    /// known set and its caches, inline bodies must be novel. Either failure
    /// disconnects the peer.
    fn handle_remember_tx(
        &mut self,
        peer_id: PeerId,
        tx_hashes: Vec<[u8; 32]>,
        txs: Vec<Vec<u8>>,
    ) {
        let Some(remembered) = self
            .peers
            .get_peer(&peer_id)
            .map(|info| info.remembered_txs.keys().copied().collect::<HashSet<_>>())
        else {
            return;
        };

        let mut additions: Vec<([u8; 32], TransactionTemplate)> = Vec::new();

        for hash in &tx_hashes {
            if remembered.contains(hash) {
                self.bad_peer(peer_id, "peer referenced duplicate remembered transaction");
                return;
            }
            let resolved = lookup(&self.known_txs, hash).cloned().or_else(|| {
                self.known_txs_caches
                    .iter()
                    .find_map(|cache| lookup(cache, hash).cloned())
            });
            match resolved {
                Some(template) => additions.push((*hash, template)),
                None => {
                    self.bad_peer(peer_id, "peer referenced unknown transaction");
                    return;
                }
            }
        }

        let mut inline: Vec<TransactionTemplate> = Vec::new();
        for data in txs {
            let template = TransactionTemplate::from_raw(data);
            let duplicate = remembered.contains(&template.txid)
                || additions.iter().any(|(_, t)| t.txid == template.txid)
                || inline.iter().any(|t| t.txid == template.txid);
            if duplicate {
                self.bad_peer(peer_id, "peer sent duplicate remembered transaction");
                return;
            }
            inline.push(template);
        }

        if let Some(info) = self.peers.get_peer_mut(&peer_id) {
            for (hash, template) in additions {
                info.remembered_txs.insert(hash, template);
            }
            for template in &inline {
                info.remembered_txs.insert(template.txid, template.clone());
            }
        }

        // Inline bodies become locally known.
        if !inline.is_empty() {
            let mut known = self.known_txs.clone();
            for template in inline {
                known.insert(template.txid, template);
            }
            self.replace_known_txs(known);
        }
    }

    /// Resolve one newly-referenced tx hash for an incoming share.
    fn resolve_new_tx(&self, info: &PeerInfo, hash: &[u8; 32]) -> TxResolution {
        if let Some(template) = lookup(&self.known_txs, hash) {
            return TxResolution::Resolved(template.clone());
        }
        if let Some(template) = lookup(&info.remembered_txs, hash) {
            return TxResolution::Resolved(template.clone());
        }
        if lookup(&self.mining_txs, hash).is_some() {
            return TxResolution::Skip;
        }
        if info.remote_tx_hashes.contains(hash) {
            return TxResolution::Skip;
        }
        // Oldest-to-newest, matching references to recently evicted txs.
        for cache in &self.known_txs_caches {
            if let Some(template) = lookup(cache, hash) {
                return TxResolution::Resolved(template.clone());
            }
        }
        TxResolution::Unknown
    }

    /// Ingest a batch of shares from a peer and relay it onward.
    async fn handle_shares(&mut self, peer_id: PeerId, wrapped: Vec<WrappedShare>) {
        let mut decoded: Vec<(WrappedShare, Share)> = Vec::new();
        for wrapper in wrapped {
            match wrapper.unwrap_share() {
                Ok(share) => decoded.push((wrapper, share)),
                Err(e) => {
                    tracing::debug!(peer = %peer_id, error = %e, "Skipping undecodable share")
                }
            }
        }
        if decoded.is_empty() {
            return;
        }

        {
            let chain = self.chain.read().await;
            if decoded.iter().all(|(_, share)| chain.contains(&share.hash)) {
                return;
            }
        }

        // Resolve every valid share's newly-referenced transactions.
        let mut accumulated: HashMap<[u8; 32], TransactionTemplate> = HashMap::new();
        if let Some(info) = self.peers.get_peer(&peer_id) {
            'shares: for (_, share) in &decoded {
                if !share.validity {
                    continue;
                }
                for hash in &share.info.new_transaction_hashes {
                    match self.resolve_new_tx(info, hash) {
                        TxResolution::Resolved(template) => {
                            accumulated.insert(template.txid, template);
                        }
                        TxResolution::Skip => {}
                        TxResolution::Unknown => {
                            tracing::warn!(
                                peer = %peer_id,
                                tx = %to_hex(hash),
                                "Peer referenced unknown transaction"
                            );
                            continue 'shares;
                        }
                    }
                }
            }
        }

        {
            let mut chain = self.chain.write().await;
            for (_, share) in &decoded {
                chain.append(share.clone());
            }
        }
        self.drain_chain_events().await;

        if !accumulated.is_empty() {
            let mut known = self.known_txs.clone();
            known.extend(accumulated);
            self.replace_known_txs(known);
        }

        let wrappers: Vec<WrappedShare> = decoded.into_iter().map(|(w, _)| w).collect();
        self.peers
            .broadcast_except(Message::Shares(wrappers), &peer_id);

        self.chain.write().await.verify();
        self.drain_chain_events().await;
    }

    /// Serve a share request by walking backward from each hash.
    async fn handle_share_req(&mut self, peer_id: PeerId, request: ShareReqMessage) {
        let is_js2pool = self
            .peers
            .get_peer(&peer_id)
            .map_or(false, |info| info.is_js2pool);
        let per_peer_cap = if is_js2pool {
            REPLY_PARENTS_LIMIT
        } else {
            REPLY_PARENTS_LIMIT_LEGACY
        };
        let budget = match request.hashes.len() as u32 {
            0 => 0,
            count => REPLY_SHARE_BUDGET / count,
        };
        let parents_limit = request.parents.min(budget).min(per_peer_cap);

        let stops: HashSet<[u8; 32]> = request.stops.iter().copied().collect();
        let mut shares: Vec<WrappedShare> = Vec::new();
        {
            let chain = self.chain.read().await;
            for hash in &request.hashes {
                for share in chain.subchain(hash, parents_limit as usize, Direction::Backward) {
                    if stops.contains(&share.hash) {
                        break;
                    }
                    match share.wrap() {
                        Ok(wrapper) => shares.push(wrapper),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to wrap share for reply")
                        }
                    }
                }
            }
        }

        let result = if shares.is_empty() {
            reply_result::NOT_FOUND
        } else {
            reply_result::GOOD
        };
        let reply = ShareReplyMessage {
            id: request.id,
            result,
            shares,
        };
        let _ = self
            .peers
            .send_to_peer(&peer_id, Message::ShareReply(reply));
    }

    /// Handle a reply to one of our share requests.
    async fn handle_share_reply(&mut self, peer_id: PeerId, reply: ShareReplyMessage) {
        if reply.result != reply_result::GOOD {
            tracing::warn!(peer = %peer_id, result = reply.result, "Share request failed");
            self.chain.write().await.check_gaps();
            self.drain_chain_events().await;
            return;
        }

        let mut fresh: Vec<Share> = Vec::new();
        {
            let chain = self.chain.read().await;
            for wrapper in &reply.shares {
                if let Ok(share) = wrapper.unwrap_share() {
                    if share.validity && !chain.contains(&share.hash) {
                        fresh.push(share);
                    }
                }
            }
        }

        if fresh.is_empty() {
            tracing::debug!(peer = %peer_id, "Share reply brought nothing new");
            self.chain.write().await.fix();
            self.drain_chain_events().await;
            return;
        }

        {
            let mut chain = self.chain.write().await;
            for share in &fresh {
                chain.append(share.clone());
            }
        }
        self.drain_chain_events().await;

        if let Some(save_tx) = &self.save_tx {
            let _ = save_tx.send(fresh);
        }
        self.pending_share_requests.remove(&reply.id);

        // Revalidate after the scheduler has had a chance to deliver any
        // traffic already queued behind this reply.
        tokio::task::yield_now().await;
        {
            let mut chain = self.chain.write().await;
            chain.check_gaps();
            chain.verify();
        }
        self.drain_chain_events().await;
    }

    /// React to queued chain events.
    async fn drain_chain_events(&mut self) {
        let events = self.chain.write().await.take_events();
        for event in events {
            match event {
                ChainEvent::GapsFound(gaps) => self.request_gaps(gaps),
                ChainEvent::OrphansFound(orphans) => {
                    tracing::info!(count = orphans.len(), "Orphan shares recorded");
                }
                ChainEvent::DeadArrived(hash) => {
                    tracing::info!(share = %to_hex(&hash), "Dead share rejected");
                }
                ChainEvent::CandidateArrived(hash) => {
                    tracing::debug!(share = %to_hex(&hash), "Tip candidate arrived");
                }
                ChainEvent::NewestChanged { hash, height } => {
                    tracing::debug!(share = %to_hex(&hash), height, "Chain tip advanced");
                }
                ChainEvent::Calculatable => {
                    tracing::info!("Share chain is calculatable");
                    self.listen_requested = true;
                }
            }
        }
    }

    /// Fan share requests for newly found gaps out to the best peers.
    fn request_gaps(&mut self, mut gaps: Vec<Gap>) {
        gaps.shuffle(&mut rand::thread_rng());
        let ordered = self.peers.peers_js2pool_first();

        for gap in gaps {
            let key = gap_key(&gap);
            if self.pending_share_requests.values().any(|k| *k == key) {
                continue;
            }

            let id = random_u256();
            let mut sent = false;
            for peer_id in ordered.iter().take(GAP_REQUEST_FANOUT) {
                let cap = if self.peers.get_peer(peer_id).map_or(false, |p| p.is_js2pool) {
                    GAP_PARENTS_LIMIT
                } else {
                    GAP_PARENTS_LIMIT_LEGACY
                };
                let request = ShareReqMessage {
                    id,
                    hashes: vec![gap.descendent],
                    parents: gap.length.min(cap),
                    stops: Vec::new(),
                };
                if self
                    .peers
                    .send_to_peer(peer_id, Message::ShareReq(request))
                    .is_ok()
                {
                    sent = true;
                }
            }
            if sent {
                self.pending_share_requests.insert(id, key);
            }
        }
    }

    /// Replace the known-tx view, broadcasting the diff.
    ///
    /// Additions go out as `have_tx`, removals as `losing_tx`; the removed
    /// set is pushed onto the snapshot ring so peers referencing a recently
    /// evicted tx can still be served.
    fn replace_known_txs(&mut self, new: HashMap<[u8; 32], TransactionTemplate>) {
        let old = std::mem::replace(&mut self.known_txs, new);

        let added: Vec<[u8; 32]> = self
            .known_txs
            .keys()
            .filter(|key| !old.contains_key(*key))
            .copied()
            .collect();
        let removed: HashMap<[u8; 32], TransactionTemplate> = old
            .into_iter()
            .filter(|(key, _)| !self.known_txs.contains_key(key))
            .collect();

        if !added.is_empty() {
            self.peers.broadcast(Message::HaveTx(added));
        }
        if !removed.is_empty() {
            self.peers
                .broadcast(Message::LosingTx(removed.keys().copied().collect()));
        }

        self.known_txs_caches.push_back(removed);
        while self.known_txs_caches.len() > KNOWN_TXS_CACHE_DEPTH {
            self.known_txs_caches.pop_front();
        }
    }

    /// Replace the mining-tx view, telling each peer what to remember and
    /// what to forget.
    fn replace_mining_txs(&mut self, new: HashMap<[u8; 32], TransactionTemplate>) {
        let old = std::mem::replace(&mut self.mining_txs, new);

        let added: Vec<TransactionTemplate> = self
            .mining_txs
            .values()
            .filter(|t| !old.contains_key(&t.txid))
            .cloned()
            .collect();
        let removed: Vec<TransactionTemplate> = old
            .into_values()
            .filter(|t| !self.mining_txs.contains_key(&t.txid))
            .collect();

        if !added.is_empty() {
            for peer_id in self.peers.peer_ids() {
                let message = self.build_remember_tx(&peer_id, &added);
                let _ = self.peers.send_to_peer(&peer_id, message);
            }
        }
        if !removed.is_empty() {
            let total_size: usize = removed.iter().map(|t| t.byte_size()).sum();
            let message = Message::ForgetTx {
                tx_hashes: removed.iter().map(|t| t.txid).collect(),
                total_size: total_size as u32,
            };
            self.peers.broadcast(message);
        }
    }

    /// Rebuild the mining view from a fresh template and merge it into the
    /// known view.
    pub fn update_mining_template(&mut self, template: BlockTemplate) {
        let mining: HashMap<[u8; 32], TransactionTemplate> = template
            .transactions
            .into_iter()
            .map(|t| (t.txid, t))
            .collect();

        let mut known = self.known_txs.clone();
        for template in mining.values() {
            known.insert(template.txid, template.clone());
        }

        self.replace_mining_txs(mining);
        self.replace_known_txs(known);
    }

    /// Drop deprecated txs from the known view (unless still mined) and from
    /// every peer's remembered set.
    pub fn remove_deprecated_txs(&mut self, hashes: &[[u8; 32]]) {
        let mut known = self.known_txs.clone();
        for hash in hashes {
            if !self.mining_txs.contains_key(hash) {
                known.remove(hash);
            }
        }
        self.replace_known_txs(known);

        for peer_id in self.peers.peer_ids() {
            if let Some(info) = self.peers.get_peer_mut(&peer_id) {
                for hash in hashes {
                    info.remembered_txs.remove(hash);
                }
            }
        }
    }

    /// Gracefully close all peer connections.
    async fn shutdown_peers(&mut self) {
        tracing::info!(count = self.peer_tasks.len(), "Closing peer connections");
        for peer_id in self.peers.peer_ids() {
            let _ = self.peers.disconnect_peer(&peer_id);
        }
        for (_, handle) in self.peer_tasks.drain() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_node() -> PoolNode {
        let chain = Arc::new(RwLock::new(ShareChain::with_window(4, 8)));
        PoolNode::new(
            P2pConfig::new("127.0.0.1:0".parse().unwrap()).with_max_conn(16),
            chain,
        )
    }

    /// Register a fake peer and return its command receiver.
    fn add_fake_peer(
        node: &mut PoolNode,
        id: u64,
        js2pool: bool,
    ) -> (PeerId, mpsc::UnboundedReceiver<crate::peer::PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = PeerId::new(id);
        let mut info = PeerInfo::new(
            peer_id,
            format!("127.0.0.{}:9333", id).parse().unwrap(),
            ConnectionDirection::Inbound,
        );
        info.is_js2pool = js2pool;
        node.peers.add_peer(info, tx);
        (peer_id, rx)
    }

    fn drain_sent(
        rx: &mut mpsc::UnboundedReceiver<crate::peer::PeerCommand>,
    ) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(crate::peer::PeerCommand::Send(message)) => out.push(message),
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    fn template(tag: u8) -> TransactionTemplate {
        TransactionTemplate::from_raw(vec![tag, tag, tag])
    }

    #[test]
    fn test_mining_template_updates_views() {
        let mut node = test_node();
        let (_, mut rx) = add_fake_peer(&mut node, 1, true);

        let a = template(1);
        let b = template(2);
        node.update_mining_template(BlockTemplate {
            transactions: vec![a.clone(), b.clone()],
        });

        assert_eq!(node.mining_txs.len(), 2);
        assert!(node.known_txs.contains_key(&a.txid));
        assert!(node.known_txs.contains_key(&b.txid));

        let sent = drain_sent(&mut rx);
        // The peer hears about the mining set and the new known txs.
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::RememberTx { txs, .. } if txs.len() == 2)));
        assert!(sent
            .iter()
            .any(|m| matches!(m, Message::HaveTx(h) if h.len() == 2)));
    }

    #[test]
    fn test_known_txs_diff_broadcasts_once_per_peer() {
        let mut node = test_node();
        let (_, mut rx1) = add_fake_peer(&mut node, 1, false);
        let (_, mut rx2) = add_fake_peer(&mut node, 2, true);

        let a = template(1);
        let b = template(2);
        let c = template(3);

        let mut known = HashMap::new();
        known.insert(a.txid, a.clone());
        known.insert(b.txid, b.clone());
        node.replace_known_txs(known);

        for rx in [&mut rx1, &mut rx2] {
            let sent = drain_sent(rx);
            let have: Vec<_> = sent
                .iter()
                .filter(|m| matches!(m, Message::HaveTx(_)))
                .collect();
            assert_eq!(have.len(), 1);
        }

        // {a, b} -> {b, c}
        let mut known = HashMap::new();
        known.insert(b.txid, b.clone());
        known.insert(c.txid, c.clone());
        node.replace_known_txs(known);

        for rx in [&mut rx1, &mut rx2] {
            let sent = drain_sent(rx);
            assert!(sent
                .iter()
                .any(|m| matches!(m, Message::HaveTx(h) if h == &vec![c.txid])));
            assert!(sent
                .iter()
                .any(|m| matches!(m, Message::LosingTx(l) if l == &vec![a.txid])));
        }

        // The removed snapshot ring gained an entry holding {a}.
        assert!(node
            .known_txs_caches
            .iter()
            .any(|cache| cache.contains_key(&a.txid)));
    }

    #[test]
    fn test_known_txs_cache_ring_bounded() {
        let mut node = test_node();
        for round in 0..15u8 {
            let t = template(round);
            let mut known = HashMap::new();
            known.insert(t.txid, t);
            node.replace_known_txs(known);
        }
        assert!(node.known_txs_caches.len() <= KNOWN_TXS_CACHE_DEPTH);
    }

    #[test]
    fn test_remember_tx_partition() {
        let mut node = test_node();
        let (peer_id, _rx) = add_fake_peer(&mut node, 1, true);

        let advertised = template(1);
        let fresh = template(2);
        node.peers
            .get_peer_mut(&peer_id)
            .unwrap()
            .remote_tx_hashes
            .insert(advertised.txid);

        let message = node.build_remember_tx(&peer_id, &[advertised.clone(), fresh.clone()]);
        match message {
            Message::RememberTx { tx_hashes, txs } => {
                assert_eq!(tx_hashes, vec![advertised.txid]);
                assert_eq!(txs, vec![fresh.data]);
            }
            other => panic!("unexpected message: {}", other),
        }
    }

    #[test]
    fn test_have_tx_evicts_before_insert() {
        let mut node = test_node();
        let (peer_id, _rx) = add_fake_peer(&mut node, 1, false);

        node.handle_have_tx(peer_id, (0..10u8).map(|t| [t; 32]).collect());
        assert_eq!(
            node.peers.get_peer(&peer_id).unwrap().remote_tx_hashes.len(),
            10
        );

        // A 4-hash batch lands on a full set: trim happens first, then the
        // batch pushes the set to 14.
        node.handle_have_tx(peer_id, (10..14u8).map(|t| [t; 32]).collect());
        let set = &node.peers.get_peer(&peer_id).unwrap().remote_tx_hashes;
        assert_eq!(set.len(), 14);

        // The next message trims back down, oldest first.
        node.handle_have_tx(peer_id, vec![[99u8; 32]]);
        let set = &node.peers.get_peer(&peer_id).unwrap().remote_tx_hashes;
        assert_eq!(set.len(), 11);
        assert!(!set.contains(&[0u8; 32]));
        assert!(set.contains(&[99u8; 32]));
    }

    #[test]
    fn test_remember_tx_unknown_reference_disconnects() {
        let mut node = test_node();
        let (peer_id, mut rx) = add_fake_peer(&mut node, 1, false);

        node.handle_remember_tx(peer_id, vec![[7u8; 32]], Vec::new());

        let mut disconnected = false;
        while let Ok(command) = rx.try_recv() {
            if matches!(command, crate::peer::PeerCommand::Disconnect) {
                disconnected = true;
            }
        }
        assert!(disconnected);
    }

    #[test]
    fn test_remember_tx_resolves_from_cache() {
        let mut node = test_node();
        let (peer_id, _rx) = add_fake_peer(&mut node, 1, false);

        // A tx that was known once and then evicted lives in the ring.
        let old = template(5);
        let mut known = HashMap::new();
        known.insert(old.txid, old.clone());
        node.replace_known_txs(known);
        node.replace_known_txs(HashMap::new());
        assert!(!node.known_txs.contains_key(&old.txid));

        node.handle_remember_tx(peer_id, vec![old.txid], Vec::new());

        let info = node.peers.get_peer(&peer_id).unwrap();
        assert!(info.remembered_txs.contains_key(&old.txid));
    }

    #[test]
    fn test_remember_tx_inline_merges_into_known() {
        let mut node = test_node();
        let (peer_id, _rx) = add_fake_peer(&mut node, 1, false);

        let body = vec![0xAB, 0xCD];
        let expected = TransactionTemplate::from_raw(body.clone());
        node.handle_remember_tx(peer_id, Vec::new(), vec![body]);

        assert!(node.known_txs.contains_key(&expected.txid));
        let info = node.peers.get_peer(&peer_id).unwrap();
        assert!(info.remembered_txs.contains_key(&expected.txid));
    }

    #[test]
    fn test_gap_requests_deduped_and_fanned_out() {
        let mut node = test_node();
        let mut receivers = Vec::new();
        for id in 1..=10u64 {
            let (_, rx) = add_fake_peer(&mut node, id, id % 2 == 0);
            receivers.push(rx);
        }

        let gap = Gap {
            descendent: [9u8; 32],
            descendent_height: 102,
            length: 1,
        };
        node.request_gaps(vec![gap.clone()]);
        assert_eq!(node.pending_share_requests.len(), 1);

        let requests: usize = receivers
            .iter_mut()
            .map(|rx| {
                drain_sent(rx)
                    .iter()
                    .filter(|m| matches!(m, Message::ShareReq(_)))
                    .count()
            })
            .sum();
        assert_eq!(requests, GAP_REQUEST_FANOUT);

        // The same gap is not re-requested while outstanding.
        node.request_gaps(vec![gap]);
        assert_eq!(node.pending_share_requests.len(), 1);
        let again: usize = receivers.iter_mut().map(|rx| drain_sent(rx).len()).sum();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_gap_parents_capped_per_capability() {
        let mut node = test_node();
        let (_, mut legacy_rx) = add_fake_peer(&mut node, 1, false);
        let (_, mut capable_rx) = add_fake_peer(&mut node, 2, true);

        let gap = Gap {
            descendent: [9u8; 32],
            descendent_height: 5000,
            length: 400,
        };
        node.request_gaps(vec![gap]);

        for (rx, cap) in [
            (&mut legacy_rx, GAP_PARENTS_LIMIT_LEGACY),
            (&mut capable_rx, GAP_PARENTS_LIMIT),
        ] {
            let sent = drain_sent(rx);
            let parents = sent
                .iter()
                .find_map(|m| match m {
                    Message::ShareReq(req) => Some(req.parents),
                    _ => None,
                })
                .expect("share request sent");
            assert_eq!(parents, cap);
        }
    }

    #[test]
    fn test_remove_deprecated_txs_keeps_mined() {
        let mut node = test_node();
        let (peer_id, _rx) = add_fake_peer(&mut node, 1, false);

        let mined = template(1);
        let stale = template(2);
        node.update_mining_template(BlockTemplate {
            transactions: vec![mined.clone()],
        });
        let mut known = node.known_txs.clone();
        known.insert(stale.txid, stale.clone());
        node.replace_known_txs(known);

        node.peers
            .get_peer_mut(&peer_id)
            .unwrap()
            .remembered_txs
            .insert(stale.txid, stale.clone());

        node.remove_deprecated_txs(&[mined.txid, stale.txid]);

        assert!(node.known_txs.contains_key(&mined.txid), "mined tx stays");
        assert!(!node.known_txs.contains_key(&stale.txid));
        let info = node.peers.get_peer(&peer_id).unwrap();
        assert!(!info.remembered_txs.contains_key(&stale.txid));
    }

    #[tokio::test]
    async fn test_share_req_empty_hashes_not_found() {
        let mut node = test_node();
        let (peer_id, mut rx) = add_fake_peer(&mut node, 1, true);

        node.handle_share_req(
            peer_id,
            ShareReqMessage {
                id: U256::from(1u64),
                hashes: Vec::new(),
                parents: 10,
                stops: Vec::new(),
            },
        )
        .await;

        let sent = drain_sent(&mut rx);
        match sent.as_slice() {
            [Message::ShareReply(reply)] => {
                assert_eq!(reply.result, reply_result::NOT_FOUND);
                assert!(reply.shares.is_empty());
                assert_eq!(reply.id, U256::from(1u64));
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_share_req_serves_backward_walk() {
        let mut node = test_node();
        let (peer_id, mut rx) = add_fake_peer(&mut node, 1, true);

        // A 5-share parent-linked chain in the store.
        let mut shares = Vec::new();
        let mut prev = [0u8; 32];
        {
            let mut chain = node.chain.write().await;
            for i in 0..5u8 {
                let share = Share {
                    hash: [i + 1; 32],
                    info: sharepool_core::ShareInfo {
                        abs_height: u32::from(i),
                        timestamp: 0,
                        data: sharepool_core::ShareData { previous_share_hash: prev },
                        new_transaction_hashes: Vec::new(),
                    },
                    work: 1,
                    min_work: 1,
                    validity: true,
                };
                prev = share.hash;
                shares.push(share.clone());
                chain.append(share);
            }
            chain.take_events();
        }

        node.handle_share_req(
            peer_id,
            ShareReqMessage {
                id: U256::from(9u64),
                hashes: vec![shares[4].hash],
                parents: 3,
                stops: Vec::new(),
            },
        )
        .await;

        let sent = drain_sent(&mut rx);
        match sent.as_slice() {
            [Message::ShareReply(reply)] => {
                assert_eq!(reply.result, reply_result::GOOD);
                let hashes: Vec<[u8; 32]> = reply
                    .shares
                    .iter()
                    .map(|w| w.unwrap_share().unwrap().hash)
                    .collect();
                assert_eq!(hashes, vec![shares[4].hash, shares[3].hash, shares[2].hash]);
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_share_req_honours_stops() {
        let mut node = test_node();
        let (peer_id, mut rx) = add_fake_peer(&mut node, 1, true);

        let mut prev = [0u8; 32];
        let mut hashes = Vec::new();
        {
            let mut chain = node.chain.write().await;
            for i in 0..4u8 {
                let share = Share {
                    hash: [i + 1; 32],
                    info: sharepool_core::ShareInfo {
                        abs_height: u32::from(i),
                        timestamp: 0,
                        data: sharepool_core::ShareData { previous_share_hash: prev },
                        new_transaction_hashes: Vec::new(),
                    },
                    work: 1,
                    min_work: 1,
                    validity: true,
                };
                prev = share.hash;
                hashes.push(share.hash);
                chain.append(share);
            }
            chain.take_events();
        }

        node.handle_share_req(
            peer_id,
            ShareReqMessage {
                id: U256::from(2u64),
                hashes: vec![hashes[3]],
                parents: 10,
                stops: vec![hashes[1]],
            },
        )
        .await;

        let sent = drain_sent(&mut rx);
        match sent.as_slice() {
            [Message::ShareReply(reply)] => {
                // The walk stops before the stop hash: only heights 3 and 2.
                assert_eq!(reply.shares.len(), 2);
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }
}
