//! Peer protocol messages.
//!
//! Thirteen message types with pure encode/decode contracts over the payload
//! bytes (not the frame). Encoders are infallible from a typed value;
//! decoders are total on well-formed input and return a typed error on
//! truncation or unrecognised variants.

use std::fmt;
use std::net::IpAddr;

use sharepool_core::block::{BlockHeader, HEADER_LENGTH};
use sharepool_core::{to_hex, WrappedShare, U256};

use crate::error::{P2pError, P2pResult};
use crate::protocol::wire::{Reader, Writer};

/// A peer network address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    /// Service bits advertised for this address.
    pub services: u64,
    /// IP address.
    pub ip: IpAddr,
    /// Listening port.
    pub port: u16,
}

impl PeerAddress {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.services);
        w.put_address(self.ip, self.port);
    }

    fn decode(r: &mut Reader<'_>) -> P2pResult<Self> {
        let services = r.u64()?;
        let (ip, port) = r.address()?;
        Ok(Self { services, ip, port })
    }
}

/// A peer address with the time it was last seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressEntry {
    /// Unix timestamp the address was last seen active.
    pub timestamp: u64,
    /// The address itself.
    pub address: PeerAddress,
}

/// Handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version number.
    pub version: u32,
    /// Service bits.
    pub services: u64,
    /// The receiver's address as the sender sees it.
    pub address_to: PeerAddress,
    /// The sender's own address.
    pub address_from: PeerAddress,
    /// Connection nonce (self-connection detection).
    pub nonce: u64,
    /// Sub-version string; the `js2pool` prefix grants larger bounds.
    pub sub_version: String,
    /// The sender's share-chain tip, or the zero hash.
    pub best_share_hash: [u8; 32],
}

/// Share-request message: ask for up to `parents` ancestors of each hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareReqMessage {
    /// 256-bit request id, echoed in the reply.
    pub id: U256,
    /// Starting hashes.
    pub hashes: Vec<[u8; 32]>,
    /// Requested ancestor count.
    pub parents: u32,
    /// Hashes at which the walk stops.
    pub stops: Vec<[u8; 32]>,
}

/// Share-reply result codes.
pub mod reply_result {
    /// Shares found.
    pub const GOOD: u8 = 0;
    /// Nothing found for the requested hashes.
    pub const NOT_FOUND: u8 = 2;
}

/// Reply to a share request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareReplyMessage {
    /// Echoed request id.
    pub id: U256,
    /// Result code (`reply_result`).
    pub result: u8,
    /// The shares found, newest first.
    pub shares: Vec<WrappedShare>,
}

/// All peer protocol messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake.
    Version(VersionMessage),
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Known peer addresses.
    Addrs(Vec<AddressEntry>),
    /// The sender's listening port.
    AddrMe(u16),
    /// Request for peer addresses.
    GetAddrs {
        /// Number of addresses desired.
        count: u32,
    },
    /// Transactions the sender can describe.
    HaveTx(Vec<[u8; 32]>),
    /// Transactions the sender no longer describes.
    LosingTx(Vec<[u8; 32]>),
    /// Ask the remote to drop remembered transactions.
    ForgetTx {
        /// Hashes to forget.
        tx_hashes: Vec<[u8; 32]>,
        /// Total byte size of the forgotten bodies.
        total_size: u32,
    },
    /// Ask the remote to retain transactions for share resolution.
    RememberTx {
        /// References to previously advertised transactions.
        tx_hashes: Vec<[u8; 32]>,
        /// Full transaction bodies sent inline.
        txs: Vec<Vec<u8>>,
    },
    /// The sender's best upstream block header.
    BestBlock(BlockHeader),
    /// Wrapped shares.
    Shares(Vec<WrappedShare>),
    /// Request for share history.
    ShareReq(ShareReqMessage),
    /// Reply to a share request.
    ShareReply(ShareReplyMessage),
}

impl Message {
    /// The wire command for this message.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Addrs(_) => "addrs",
            Message::AddrMe(_) => "addrme",
            Message::GetAddrs { .. } => "getaddrs",
            Message::HaveTx(_) => "have_tx",
            Message::LosingTx(_) => "losing_tx",
            Message::ForgetTx { .. } => "forget_tx",
            Message::RememberTx { .. } => "remember_tx",
            Message::BestBlock(_) => "bestblock",
            Message::Shares(_) => "shares",
            Message::ShareReq(_) => "sharereq",
            Message::ShareReply(_) => "sharereply",
        }
    }

    /// Encode the payload bytes (frame head excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Version(v) => {
                w.put_u32(v.version);
                w.put_u64(v.services);
                v.address_to.encode(&mut w);
                v.address_from.encode(&mut w);
                w.put_u64(v.nonce);
                w.put_var_str(&v.sub_version);
                w.put_hash(&v.best_share_hash);
            }
            Message::Ping | Message::Pong => {}
            Message::Addrs(entries) => {
                w.put_var_int(entries.len() as u64);
                for entry in entries {
                    w.put_u64(entry.timestamp);
                    entry.address.encode(&mut w);
                }
            }
            Message::AddrMe(port) => {
                w.put_u16(*port);
            }
            Message::GetAddrs { count } => {
                w.put_u32(*count);
            }
            Message::HaveTx(hashes) | Message::LosingTx(hashes) => {
                w.put_hash_list(hashes);
            }
            Message::ForgetTx { tx_hashes, total_size } => {
                w.put_hash_list(tx_hashes);
                w.put_u32(*total_size);
            }
            Message::RememberTx { tx_hashes, txs } => {
                w.put_hash_list(tx_hashes);
                w.put_var_int(txs.len() as u64);
                for tx in txs {
                    w.put_var_bytes(tx);
                }
            }
            Message::BestBlock(header) => {
                w.put_bytes(&header.encode());
            }
            Message::Shares(shares) => {
                put_wrapped_shares(&mut w, shares);
            }
            Message::ShareReq(req) => {
                w.put_hash(&req.id.to_le_bytes());
                w.put_hash_list(&req.hashes);
                w.put_var_int(u64::from(req.parents));
                w.put_hash_list(&req.stops);
            }
            Message::ShareReply(reply) => {
                w.put_hash(&reply.id.to_le_bytes());
                w.put_u8(reply.result);
                put_wrapped_shares(&mut w, &reply.shares);
            }
        }
        w.into_bytes()
    }

    /// Decode a payload for `command`.
    ///
    /// Returns `Ok(None)` for an unknown command; the caller logs and
    /// continues per the protocol contract.
    pub fn decode_payload(command: &str, payload: &[u8]) -> P2pResult<Option<Message>> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let version = r.u32()?;
                let services = r.u64()?;
                let address_to = PeerAddress::decode(&mut r)?;
                let address_from = PeerAddress::decode(&mut r)?;
                let nonce = r.u64()?;
                let sub_version = r.var_str()?;
                let best_share_hash = r.hash()?;
                Message::Version(VersionMessage {
                    version,
                    services,
                    address_to,
                    address_from,
                    nonce,
                    sub_version,
                    best_share_hash,
                })
            }
            "ping" => Message::Ping,
            "pong" => Message::Pong,
            "addrs" => {
                let count = r.var_int()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let timestamp = r.u64()?;
                    let address = PeerAddress::decode(&mut r)?;
                    entries.push(AddressEntry { timestamp, address });
                }
                Message::Addrs(entries)
            }
            "addrme" => Message::AddrMe(r.u16()?),
            "getaddrs" => Message::GetAddrs { count: r.u32()? },
            "have_tx" => Message::HaveTx(r.hash_list()?),
            "losing_tx" => Message::LosingTx(r.hash_list()?),
            "forget_tx" => {
                let tx_hashes = r.hash_list()?;
                let total_size = r.u32()?;
                Message::ForgetTx { tx_hashes, total_size }
            }
            "remember_tx" => {
                let tx_hashes = r.hash_list()?;
                let count = r.var_int()?;
                let mut txs = Vec::new();
                for _ in 0..count {
                    txs.push(r.var_bytes()?);
                }
                Message::RememberTx { tx_hashes, txs }
            }
            "bestblock" => {
                if payload.len() != HEADER_LENGTH {
                    return Err(P2pError::Decode(format!(
                        "bestblock payload must be {} bytes, got {}",
                        HEADER_LENGTH,
                        payload.len()
                    )));
                }
                return Ok(Some(Message::BestBlock(BlockHeader::decode(payload)?)));
            }
            "shares" => Message::Shares(read_wrapped_shares(&mut r)?),
            "sharereq" => {
                let id = U256::from_le_bytes(&r.hash()?);
                let hashes = r.hash_list()?;
                let parents = read_u32_var(&mut r)?;
                let stops = r.hash_list()?;
                Message::ShareReq(ShareReqMessage { id, hashes, parents, stops })
            }
            "sharereply" => {
                let id = U256::from_le_bytes(&r.hash()?);
                let result = r.u8()?;
                let shares = read_wrapped_shares(&mut r)?;
                Message::ShareReply(ShareReplyMessage { id, result, shares })
            }
            _ => return Ok(None),
        };
        r.expect_end()?;
        Ok(Some(message))
    }
}

fn put_wrapped_shares(w: &mut Writer, shares: &[WrappedShare]) {
    w.put_var_int(shares.len() as u64);
    for share in shares {
        w.put_var_int(share.version);
        w.put_var_bytes(&share.contents);
    }
}

fn read_wrapped_shares(r: &mut Reader<'_>) -> P2pResult<Vec<WrappedShare>> {
    let count = r.var_int()?;
    let mut shares = Vec::new();
    for _ in 0..count {
        let version = r.var_int()?;
        let contents = r.var_bytes()?;
        shares.push(WrappedShare { version, contents });
    }
    Ok(shares)
}

fn read_u32_var(r: &mut Reader<'_>) -> P2pResult<u32> {
    let value = r.var_int()?;
    u32::try_from(value)
        .map_err(|_| P2pError::Decode(format!("value {} does not fit in u32", value)))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Version(v) => write!(
                f,
                "version(v={}, agent={}, best={})",
                v.version,
                v.sub_version,
                &to_hex(&v.best_share_hash)[..8]
            ),
            Message::Ping => write!(f, "ping"),
            Message::Pong => write!(f, "pong"),
            Message::Addrs(entries) => write!(f, "addrs(count={})", entries.len()),
            Message::AddrMe(port) => write!(f, "addrme(port={})", port),
            Message::GetAddrs { count } => write!(f, "getaddrs(count={})", count),
            Message::HaveTx(hashes) => write!(f, "have_tx(count={})", hashes.len()),
            Message::LosingTx(hashes) => write!(f, "losing_tx(count={})", hashes.len()),
            Message::ForgetTx { tx_hashes, total_size } => {
                write!(f, "forget_tx(count={}, size={})", tx_hashes.len(), total_size)
            }
            Message::RememberTx { tx_hashes, txs } => {
                write!(f, "remember_tx(refs={}, inline={})", tx_hashes.len(), txs.len())
            }
            Message::BestBlock(header) => {
                write!(f, "bestblock(hash={})", &to_hex(&header.hash())[..8])
            }
            Message::Shares(shares) => write!(f, "shares(count={})", shares.len()),
            Message::ShareReq(req) => write!(
                f,
                "sharereq(hashes={}, parents={}, stops={})",
                req.hashes.len(),
                req.parents,
                req.stops.len()
            ),
            Message::ShareReply(reply) => write!(
                f,
                "sharereply(result={}, count={})",
                reply.result,
                reply.shares.len()
            ),
        }
    }
}
