//! Chain-store events.

/// A contiguous missing window of heights below a known share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gap {
    /// Hash of the share just above the missing range.
    pub descendent: [u8; 32],
    /// Height of the descendent share.
    pub descendent_height: u32,
    /// Number of missing heights.
    pub length: u32,
}

/// Events emitted by the share-chain store.
///
/// Queued inside the store during mutating calls; the owner drains them with
/// `take_events` immediately afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// A new main-chain tip was adopted.
    NewestChanged {
        /// Hash of the new tip.
        hash: [u8; 32],
        /// Height of the new tip.
        height: u32,
    },
    /// Missing height ranges were detected.
    GapsFound(Vec<Gap>),
    /// Shares were demoted to orphans at their height.
    OrphansFound(Vec<[u8; 32]>),
    /// A sibling of the current tip arrived.
    CandidateArrived([u8; 32]),
    /// A share below the tip had no descendant referencing it and was
    /// rejected.
    DeadArrived([u8; 32]),
    /// The verified window first reached calculatable length.
    Calculatable,
}
