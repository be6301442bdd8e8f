//! P2P configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Network magic bytes prefixing every frame. Network-configurable.
pub const NETWORK_MAGIC: [u8; 8] = [0x83, 0xE6, 0x5D, 0x2C, 0x81, 0xBF, 0x6D, 0x68];

/// Frame head length: 8 magic + 12 command + 4 length + 4 checksum.
pub const PROTOCOL_HEAD_LENGTH: usize = 28;

/// Maximum payload size in bytes (8 MB; share batches can be large).
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Current protocol version advertised in `version`.
pub const PROTOCOL_VERSION: u32 = 1300;

/// Sub-version prefix granting the larger request/reply bounds.
pub const CAPABILITY_PREFIX: &str = "js2pool";

/// Default sub-version string sent in `version`.
pub const DEFAULT_SUB_VERSION: &str = "js2pool/0.1.0";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9333;

/// Default maximum connection count.
pub const DEFAULT_MAX_CONN: usize = 50;

/// Idle deadline on every socket; expiry closes the link.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between outbound pings; must stay under the idle deadline.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for establishing outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on the per-peer advertised-tx FIFO set.
pub const REMOTE_TX_SET_LIMIT: usize = 10;

/// Depth of the removed-known-txs snapshot ring.
pub const KNOWN_TXS_CACHE_DEPTH: usize = 10;

/// How many peers a gap request fans out to.
pub const GAP_REQUEST_FANOUT: usize = 8;

/// Parent-count cap for outgoing gap requests to capable peers.
pub const GAP_PARENTS_LIMIT: u32 = 250;

/// Parent-count cap for outgoing gap requests to legacy peers.
pub const GAP_PARENTS_LIMIT_LEGACY: u32 = 79;

/// Total share budget for a single `sharereq` reply.
pub const REPLY_SHARE_BUDGET: u32 = 500;

/// Per-hash parent cap when serving a capable peer.
pub const REPLY_PARENTS_LIMIT: u32 = 500;

/// Per-hash parent cap when serving a legacy peer.
pub const REPLY_PARENTS_LIMIT_LEGACY: u32 = 100;

/// Configuration for the pool node.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,

    /// Maximum total connections (inbound + outbound).
    pub max_conn: usize,

    /// Network magic for this pool network.
    pub magic: [u8; 8],

    /// Sub-version string sent in `version`.
    pub sub_version: String,

    /// Timeout for establishing outbound connections.
    pub connect_timeout: Duration,

    /// Idle deadline per socket.
    pub idle_timeout: Duration,

    /// Interval between outbound pings.
    pub ping_interval: Duration,

    /// Initial peers to dial on startup.
    pub peers: Vec<SocketAddr>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_conn: DEFAULT_MAX_CONN,
            magic: NETWORK_MAGIC,
            sub_version: DEFAULT_SUB_VERSION.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            peers: Vec::new(),
        }
    }
}

impl P2pConfig {
    /// Create a new configuration with the specified bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the maximum connection count.
    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    /// Set the network magic.
    pub fn with_magic(mut self, magic: [u8; 8]) -> Self {
        self.magic = magic;
        self
    }

    /// Set the sub-version string.
    pub fn with_sub_version(mut self, sub_version: String) -> Self {
        self.sub_version = sub_version;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle deadline.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the initial peer list.
    pub fn with_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.peers = peers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = P2pConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_conn, DEFAULT_MAX_CONN);
        assert_eq!(config.magic, NETWORK_MAGIC);
        assert!(config.ping_interval < config.idle_timeout);
    }

    #[test]
    fn test_config_builder() {
        let config = P2pConfig::new("127.0.0.1:19333".parse().unwrap())
            .with_max_conn(4)
            .with_sub_version("js2pool/9.9.9".to_string())
            .with_peers(vec!["10.0.0.1:9333".parse().unwrap()]);

        assert_eq!(config.bind_addr.port(), 19333);
        assert_eq!(config.max_conn, 4);
        assert_eq!(config.sub_version, "js2pool/9.9.9");
        assert_eq!(config.peers.len(), 1);
    }
}
