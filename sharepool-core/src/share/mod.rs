//! Share structures.
//!
//! A share is a low-difficulty proof-of-work object forming the pool's side
//! ledger. Cryptographic construction and proof-of-work validation happen
//! outside this crate; here a share is the set of attributes the chain store
//! and the wire protocol need.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::serialization;

/// The canonical zero hash, advertised by peers with no best share.
pub const ZERO_HASH: [u8; 32] = [0u8; 32];

/// Chain-structural data of a share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareData {
    /// Hash of the parent share.
    pub previous_share_hash: [u8; 32],
}

/// Positional and content metadata of a share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    /// Monotonically assigned absolute height.
    pub abs_height: u32,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Chain-structural data.
    pub data: ShareData,
    /// Transaction ids this share references for the first time.
    pub new_transaction_hashes: Vec<[u8; 32]>,
}

/// A share as stored and relayed by the pool node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// 32-byte share identifier.
    pub hash: [u8; 32],
    /// Positional and content metadata.
    pub info: ShareInfo,
    /// Work contributed by this share.
    pub work: u64,
    /// Minimum work target the share was mined against.
    pub min_work: u64,
    /// Whether external validation accepted this share.
    ///
    /// Never carried on the wire; deserialized shares are valid pending the
    /// external proof-of-work check.
    #[serde(skip, default = "validity_default")]
    pub validity: bool,
}

fn validity_default() -> bool {
    true
}

impl Share {
    /// Share-format version tag used in the on-wire `shares` container.
    pub const VERSION: u64 = 17;

    /// Hash of the parent share.
    #[inline]
    pub fn previous_share_hash(&self) -> [u8; 32] {
        self.info.data.previous_share_hash
    }

    /// Absolute height of this share.
    #[inline]
    pub fn abs_height(&self) -> u32 {
        self.info.abs_height
    }

    /// Wrap for the on-wire `shares` container.
    pub fn wrap(&self) -> Result<WrappedShare, CodecError> {
        Ok(WrappedShare {
            version: Share::VERSION,
            contents: serialization::serialize(self)?,
        })
    }

    /// Construct a share from wrapped wire bytes.
    ///
    /// Rejects unknown version tags and malformed contents.
    pub fn from_wire(version: u64, contents: &[u8]) -> Result<Share, CodecError> {
        if version != Share::VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        Ok(serialization::deserialize(contents)?)
    }
}

/// On-wire element of the `shares` container: a version tag plus opaque
/// serialized contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedShare {
    /// Share-format version tag.
    pub version: u64,
    /// Serialized share body.
    pub contents: Vec<u8>,
}

impl WrappedShare {
    /// Decode the wrapped contents into a typed share.
    pub fn unwrap_share(&self) -> Result<Share, CodecError> {
        Share::from_wire(self.version, &self.contents)
    }
}
