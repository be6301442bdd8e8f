//! Insertion-ordered bounded set of transaction hashes.

use std::collections::{HashSet, VecDeque};

/// A FIFO set of tx hashes with oldest-first eviction.
///
/// Capacity enforcement is the caller's: `evict_down_to` runs *before* a
/// batch is inserted, so one batch can leave the set above its cap until the
/// next message arrives. That ordering is observable protocol behaviour and
/// is preserved deliberately.
#[derive(Clone, Debug, Default)]
pub struct TxFifoSet {
    order: VecDeque<[u8; 32]>,
    set: HashSet<[u8; 32]>,
}

impl TxFifoSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hashes held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether a hash is present.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.set.contains(hash)
    }

    /// Insert a hash; returns false if it was already present.
    pub fn insert(&mut self, hash: [u8; 32]) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        true
    }

    /// Remove a hash; returns whether it was present.
    pub fn remove(&mut self, hash: &[u8; 32]) -> bool {
        if !self.set.remove(hash) {
            return false;
        }
        self.order.retain(|h| h != hash);
        true
    }

    /// Evict oldest entries until at most `cap` remain.
    pub fn evict_down_to(&mut self, cap: usize) {
        while self.order.len() > cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.order.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    #[test]
    fn test_insert_contains_remove() {
        let mut set = TxFifoSet::new();
        assert!(set.insert(h(1)));
        assert!(!set.insert(h(1)));
        assert!(set.contains(&h(1)));

        assert!(set.remove(&h(1)));
        assert!(!set.remove(&h(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_eviction_is_fifo() {
        let mut set = TxFifoSet::new();
        for tag in 0..5 {
            set.insert(h(tag));
        }
        set.evict_down_to(3);

        assert_eq!(set.len(), 3);
        assert!(!set.contains(&h(0)));
        assert!(!set.contains(&h(1)));
        assert!(set.contains(&h(2)));
    }

    #[test]
    fn test_evict_before_insert_allows_overflow() {
        // The handler's ordering: trim to the cap, then insert the batch.
        let mut set = TxFifoSet::new();
        for tag in 0..10 {
            set.insert(h(tag));
        }

        set.evict_down_to(10);
        for tag in 10..14 {
            set.insert(h(tag));
        }
        // The batch pushed the set above the cap until the next message.
        assert_eq!(set.len(), 14);

        set.evict_down_to(10);
        assert_eq!(set.len(), 10);
        assert!(!set.contains(&h(3)));
        assert!(set.contains(&h(4)));
    }
}
