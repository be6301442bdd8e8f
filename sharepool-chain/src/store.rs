//! The share-chain store.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use sharepool_core::Share;

use crate::events::{ChainEvent, Gap};

/// Number of shares a fully assembled window must span before pool
/// calculations are meaningful (24h of 10-second shares).
pub const BASE_CHAIN_LENGTH: u32 = 24 * 60 * 60 / 10;

/// Maximum height span kept in memory; heights below the window are evicted.
pub const MAX_CHAIN_LENGTH: u32 = 2 * BASE_CHAIN_LENGTH;

/// Walk direction for [`ShareChain::subchain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Step toward higher heights.
    Forward,
    /// Step toward lower heights.
    Backward,
}

/// Dual-indexed in-memory share database.
///
/// Shares are indexed by hash and by absolute height. At every height the
/// list's first entry is the share currently considered on the main chain;
/// later entries are orphans or unresolved duplicates.
pub struct ShareChain {
    /// `hash -> abs_height` for every stored share.
    hash_index: HashMap<[u8; 32], u32>,
    /// `abs_height -> shares at that height`, index 0 on the main chain.
    height_index: BTreeMap<u32, Vec<Share>>,
    /// Highest stored share `(height, hash)`.
    newest: Option<(u32, [u8; 32])>,
    /// Lowest stored share `(height, hash)`.
    oldest: Option<(u32, [u8; 32])>,
    /// Whether the last `verify` walked the full window consistently.
    verified: bool,
    /// Latched once the verified window spans the base length.
    calculatable: bool,
    /// Window span required before the chain is calculatable.
    base_length: u32,
    /// Window span that triggers eviction of the oldest height.
    max_length: u32,
    /// Events queued for the owner.
    events: Vec<ChainEvent>,
}

impl ShareChain {
    /// Create a store with the protocol window constants.
    pub fn new() -> Self {
        Self::with_window(BASE_CHAIN_LENGTH, MAX_CHAIN_LENGTH)
    }

    /// Create a store with custom window lengths.
    ///
    /// Tests use short windows; production code uses [`ShareChain::new`].
    pub fn with_window(base_length: u32, max_length: u32) -> Self {
        Self {
            hash_index: HashMap::new(),
            height_index: BTreeMap::new(),
            newest: None,
            oldest: None,
            verified: false,
            calculatable: false,
            base_length,
            max_length,
            events: Vec::new(),
        }
    }

    /// Ingest a share.
    ///
    /// Returns true iff the share became a new main-chain tip worth
    /// broadcasting. Invalid, duplicate and dead shares are rejected with a
    /// false return; rejection is not an error.
    pub fn append(&mut self, share: Share) -> bool {
        if !share.validity {
            return false;
        }

        let height = share.abs_height();

        if self.share_at(height, &share.hash).is_some() {
            return false;
        }

        let Some((newest_height, _)) = self.newest else {
            // First share seeds both ends of the window.
            let hash = share.hash;
            self.insert(share);
            self.newest = Some((height, hash));
            self.oldest = Some((height, hash));
            return true;
        };

        if height > newest_height {
            self.append_tip(share, height)
        } else if height == newest_height {
            let hash = share.hash;
            self.insert(share);
            self.events.push(ChainEvent::CandidateArrived(hash));
            false
        } else {
            self.append_below(share, height)
        }
    }

    /// New tip: adopt, evict, and inspect the parent height for gaps or
    /// orphan resolution.
    fn append_tip(&mut self, share: Share, height: u32) -> bool {
        let hash = share.hash;
        let previous = share.previous_share_hash();

        self.insert(share);
        self.newest = Some((height, hash));
        self.events.push(ChainEvent::NewestChanged { hash, height });
        self.clean_deprecations();

        match self.height_index.get_mut(&(height - 1)) {
            None => {
                self.events.push(ChainEvent::GapsFound(vec![Gap {
                    descendent: hash,
                    descendent_height: height,
                    length: 1,
                }]));
            }
            Some(parents) if parents.len() == 1 => {}
            Some(parents) => {
                if let Some(pos) = parents.iter().position(|s| s.hash == previous) {
                    // Our ancestor goes to the front; the rest are orphans.
                    let verified = parents.remove(pos);
                    let orphans: Vec<[u8; 32]> = parents.iter().map(|s| s.hash).collect();
                    parents.insert(0, verified);
                    self.events.push(ChainEvent::OrphansFound(orphans));
                } else {
                    // The height is populated but none of them is our parent.
                    self.events.push(ChainEvent::GapsFound(vec![Gap {
                        descendent: hash,
                        descendent_height: height,
                        length: 1,
                    }]));
                }
            }
        }

        true
    }

    /// Share below the tip: silent gap fill, main-chain promotion, or dead
    /// rejection.
    fn append_below(&mut self, share: Share, height: u32) -> bool {
        let occupied = self
            .height_index
            .get(&height)
            .map_or(false, |list| !list.is_empty());

        if !occupied {
            self.insert(share);
            return false;
        }

        let referenced = self
            .height_index
            .get(&(height + 1))
            .map_or(false, |above| {
                above.iter().any(|d| d.previous_share_hash() == share.hash)
            });

        if !referenced {
            // No descendant points at this share; it is dead and never
            // enters the indexes.
            self.events.push(ChainEvent::DeadArrived(share.hash));
            return false;
        }

        let hash = share.hash;
        self.hash_index.insert(hash, height);
        self.maybe_update_oldest(height, hash);

        let list = self.height_index.entry(height).or_default();
        let orphans: Vec<[u8; 32]> = list.iter().map(|s| s.hash).collect();
        list.insert(0, share);
        self.events.push(ChainEvent::OrphansFound(orphans));

        false
    }

    /// Insert into both indexes and maintain `oldest`.
    fn insert(&mut self, share: Share) {
        let height = share.abs_height();
        let hash = share.hash;
        self.hash_index.insert(hash, height);
        self.height_index.entry(height).or_default().push(share);
        self.maybe_update_oldest(height, hash);
    }

    fn maybe_update_oldest(&mut self, height: u32, hash: [u8; 32]) {
        match self.oldest {
            Some((oldest_height, _)) if height >= oldest_height => {}
            _ => self.oldest = Some((height, hash)),
        }
    }

    /// Evict the oldest height once the window spans the maximum length.
    ///
    /// One height per invocation; repeated ingestion naturally advances the
    /// window.
    pub fn clean_deprecations(&mut self) {
        let (Some((newest_height, _)), Some((oldest_height, _))) = (self.newest, self.oldest)
        else {
            return;
        };

        if newest_height - oldest_height < self.max_length {
            return;
        }

        if let Some(dropped) = self.height_index.remove(&oldest_height) {
            for share in &dropped {
                self.hash_index.remove(&share.hash);
            }
        }

        self.oldest = self
            .height_index
            .iter()
            .next()
            .map(|(height, list)| (*height, list[0].hash));
    }

    /// Lazy walk of up to `length` main-chain shares starting at
    /// `start`, stepping one height per item.
    ///
    /// Terminates early on missing heights. Yields the index-0 share at each
    /// height, including the starting one.
    pub fn subchain(&self, start: &[u8; 32], length: usize, direction: Direction) -> Subchain<'_> {
        Subchain {
            chain: self,
            height: self.hash_index.get(start).copied(),
            remaining: length,
            direction,
        }
    }

    /// Walk backward from the tip requiring parent-hash linkage at every
    /// height.
    ///
    /// Sets the verified flag, and on first spanning the base length while
    /// fully consistent, latches calculatability and emits
    /// [`ChainEvent::Calculatable`] once. Returns whether the full window is
    /// consistent.
    pub fn verify(&mut self) -> bool {
        let (Some((newest_height, newest_hash)), Some((oldest_height, _))) =
            (self.newest, self.oldest)
        else {
            self.verified = false;
            return false;
        };

        let length = u64::from(newest_height - oldest_height) + 1;
        let mut expected = newest_hash;
        let mut verified: u64 = 0;
        let mut height = newest_height;

        loop {
            let Some(main) = self.height_index.get(&height).and_then(|l| l.first()) else {
                break;
            };
            if main.hash != expected {
                break;
            }
            verified += 1;
            expected = main.previous_share_hash();
            if height == oldest_height {
                break;
            }
            height -= 1;
        }

        self.verified = verified == length;
        if self.verified && verified >= u64::from(self.base_length) && !self.calculatable {
            self.calculatable = true;
            self.events.push(ChainEvent::Calculatable);
        }
        self.verified
    }

    /// Scan the height index for gaps.
    ///
    /// A gap exists between adjacent stored heights when they are
    /// non-consecutive or the lower main-chain hash does not match the upper
    /// share's parent reference. While the window is shorter than the base
    /// length an additional terminal gap below `oldest` is reported.
    pub fn check_gaps(&mut self) {
        let mut gaps = Vec::new();

        let heights: Vec<u32> = self.height_index.keys().rev().copied().collect();
        for pair in heights.windows(2) {
            let (descendent_height, ancestor_height) = (pair[0], pair[1]);
            let descendent = &self.height_index[&descendent_height][0];
            let ancestor = &self.height_index[&ancestor_height][0];

            if ancestor_height + 1 != descendent_height
                || ancestor.hash != descendent.previous_share_hash()
            {
                gaps.push(Gap {
                    descendent: descendent.hash,
                    descendent_height,
                    length: descendent_height - ancestor_height,
                });
            }
        }

        if let (Some((newest_height, _)), Some((oldest_height, oldest_hash))) =
            (self.newest, self.oldest)
        {
            let window = newest_height - oldest_height + 1;
            if window < self.base_length {
                gaps.push(Gap {
                    descendent: oldest_hash,
                    descendent_height: oldest_height,
                    length: self.base_length - window,
                });
            }
        }

        if !gaps.is_empty() {
            self.events.push(ChainEvent::GapsFound(gaps));
        }
    }

    /// Recovery hook for share replies that brought nothing usable: drop the
    /// verified flag and rescan for gaps so requests can be re-armed.
    pub fn fix(&mut self) {
        self.verified = false;
        self.check_gaps();
    }

    /// Get a share by hash.
    pub fn get(&self, hash: &[u8; 32]) -> Option<&Share> {
        let height = *self.hash_index.get(hash)?;
        self.share_at(height, hash)
    }

    fn share_at(&self, height: u32, hash: &[u8; 32]) -> Option<&Share> {
        self.height_index
            .get(&height)?
            .iter()
            .find(|s| s.hash == *hash)
    }

    /// Whether a share with this hash is stored.
    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.hash_index.contains_key(hash)
    }

    /// Current tip `(height, hash)`.
    pub fn newest(&self) -> Option<(u32, [u8; 32])> {
        self.newest
    }

    /// Oldest stored share `(height, hash)`.
    pub fn oldest(&self) -> Option<(u32, [u8; 32])> {
        self.oldest
    }

    /// Number of stored shares.
    pub fn len(&self) -> usize {
        self.hash_index.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.hash_index.is_empty()
    }

    /// All shares at a height, main-chain share first.
    pub fn shares_at_height(&self, height: u32) -> &[Share] {
        self.height_index
            .get(&height)
            .map_or(&[], |list| list.as_slice())
    }

    /// Whether the last verification walked the full window.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether the chain has ever reached calculatable length.
    pub fn is_calculatable(&self) -> bool {
        self.calculatable
    }

    /// Drain queued events.
    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        mem::take(&mut self.events)
    }
}

impl Default for ShareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`ShareChain::subchain`].
pub struct Subchain<'a> {
    chain: &'a ShareChain,
    height: Option<u32>,
    remaining: usize,
    direction: Direction,
}

impl<'a> Iterator for Subchain<'a> {
    type Item = &'a Share;

    fn next(&mut self) -> Option<&'a Share> {
        if self.remaining == 0 {
            return None;
        }
        let height = self.height?;
        let share = self.chain.height_index.get(&height)?.first()?;

        self.remaining -= 1;
        self.height = match self.direction {
            Direction::Forward => height.checked_add(1),
            Direction::Backward => height.checked_sub(1),
        };

        Some(share)
    }
}
