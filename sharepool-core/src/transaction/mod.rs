//! Transaction templates.
//!
//! The pool never interprets transaction bodies; it relays them and resolves
//! share references against them. Parsing is the upstream blockchain codec's
//! concern, abstracted here to id derivation over the raw body.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256d, to_hex};

/// A pending blockchain transaction as seen by the pool.
///
/// The `(txid, hash)` pair exists because some chains distinguish the witness
/// hash from the transaction id; lookups accept either.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTemplate {
    /// Transaction id.
    pub txid: [u8; 32],
    /// Transaction hash (wtxid on chains that distinguish it).
    pub hash: [u8; 32],
    /// Raw transaction body.
    pub data: Vec<u8>,
}

impl TransactionTemplate {
    /// Build a template from a raw transaction body, deriving both ids.
    pub fn from_raw(data: Vec<u8>) -> Self {
        let id = sha256d(&data);
        Self { txid: id, hash: id, data }
    }

    /// Primary lookup id.
    #[inline]
    pub fn id(&self) -> [u8; 32] {
        self.txid
    }

    /// Whether `key` matches this template (txid falling back to hash).
    #[inline]
    pub fn matches(&self, key: &[u8; 32]) -> bool {
        self.txid == *key || self.hash == *key
    }

    /// Hex-encoded transaction body.
    pub fn to_hex(&self) -> String {
        to_hex(&self.data)
    }

    /// Size of the raw body in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// A block template pushed by the external mining-template feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplate {
    /// Transactions included in the template.
    pub transactions: Vec<TransactionTemplate>,
}
