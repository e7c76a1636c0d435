//! `first -> membership` map with aggregate sizes.

use std::collections::{HashMap, HashSet};

use crate::codec::{put_u64, put_u8, ByteReader};
use crate::error::{Result, StoreError};

use super::diff::IdPairDiff;
use super::second::{IdPairSecond, COMPLEMENT_BYTE, DIRECT_BYTE};
use super::{IdPair, IdSet, SENTINEL_ID};

/// Relation container for one pairing shard.
///
/// `len` is the logical pairing count and `physical_len` the number of
/// ids actually stored. `first_complements` lists keys in complement mode
/// so universe changes only visit those.
#[derive(Debug, Clone)]
pub struct IdPairContainer {
    map: HashMap<u64, IdPairSecond>,
    len: usize,
    physical_len: usize,
    first_complements: HashSet<u64>,
    /// Complement-mode keys of the main file, with their physical sizes,
    /// as of the last time the contents matched it.
    synced_complements: HashMap<u64, usize>,
    /// Universe size those keys were sized against.
    synced_universe_len: usize,
    threshold: f64,
}

impl IdPairContainer {
    pub fn new(threshold: f64) -> Self {
        Self {
            map: HashMap::new(),
            len: 0,
            physical_len: 0,
            first_complements: HashSet::new(),
            synced_complements: HashMap::new(),
            synced_universe_len: 0,
            threshold,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn physical_len(&self) -> usize {
        self.physical_len
    }

    pub fn first_complements(&self) -> &HashSet<u64> {
        &self.first_complements
    }

    pub fn synced_complement_count(&self) -> usize {
        self.synced_complements.len()
    }

    /// Keys stored in complement mode in the main file.
    pub fn synced_complement_keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.synced_complements.keys().copied()
    }

    /// Snapshot the complement keys once the contents match the main file.
    /// Keys with no members are not written and so are not recorded.
    pub fn mark_synced(&mut self, universe: &IdSet) {
        let n = universe.len();
        self.synced_complements = self
            .first_complements
            .iter()
            .filter_map(|first| self.map.get(first).map(|set| (*first, set)))
            .filter(|(_, set)| set.len(n) > 0)
            .map(|(first, set)| (first, set.physical_len()))
            .collect();
        self.synced_universe_len = n;
    }

    /// Size the main file decodes to against `universe`, given `recorded`,
    /// its size against the universe it was synced with. Only complement
    /// keys depend on the universe size.
    pub fn synced_len(&self, recorded: usize, universe: &IdSet) -> usize {
        let n = universe.len();
        let (then, now) = self
            .synced_complements
            .values()
            .fold((0, 0), |(then, now), &physical| {
                (
                    then + self.synced_universe_len.saturating_sub(physical),
                    now + n.saturating_sub(physical),
                )
            });
        recorded + now - then
    }

    pub fn first_contents(&self, first: u64) -> Option<&IdPairSecond> {
        self.map.get(&first)
    }

    pub fn contains(&self, (first, second): IdPair, universe: &IdSet) -> bool {
        self.map.get(&first).is_some_and(|s| s.contains(second, universe))
    }

    /// Apply `mutate` to one key's membership, keeping aggregates and the
    /// complement-key index in step.
    fn update<F>(&mut self, first: u64, universe: &IdSet, mutate: F) -> bool
    where
        F: FnOnce(&mut IdPairSecond, &IdSet, f64) -> bool,
    {
        let threshold = self.threshold;
        let second = self.map.entry(first).or_default();
        let before_len = second.len(universe.len());
        let before_physical = second.physical_len();

        let changed = mutate(second, universe, threshold);

        let after_len = second.len(universe.len());
        let after_physical = second.physical_len();
        let is_complement = second.is_complement();
        let drop_key = !is_complement && after_physical == 0;

        self.len = self.len + after_len - before_len;
        self.physical_len = self.physical_len + after_physical - before_physical;
        if is_complement {
            self.first_complements.insert(first);
        } else {
            self.first_complements.remove(&first);
        }
        if drop_key {
            self.map.remove(&first);
        }
        changed
    }

    pub fn insert(&mut self, (first, second): IdPair, universe: &IdSet) -> bool {
        self.update(first, universe, |set, u, t| set.insert(second, u, t))
    }

    pub fn remove(&mut self, (first, second): IdPair, universe: &IdSet) -> bool {
        if !self.map.contains_key(&first) {
            return false;
        }
        self.update(first, universe, |set, u, t| set.remove(second, u, t))
    }

    /// Record a new second-side universe id in every complement-mode key.
    ///
    /// `universe` must already contain `second`. Returns true if any key
    /// was touched.
    pub fn insert_complement(&mut self, second: u64, universe: &IdSet) -> Result<bool> {
        self.propagate(second, universe, IdPairSecond::insert_complement)
    }

    /// Drop a removed second-side universe id from every complement-mode
    /// key. `universe` must no longer contain `second`.
    pub fn delete_complement(&mut self, second: u64, universe: &IdSet) -> Result<bool> {
        self.propagate(second, universe, IdPairSecond::delete_complement)
    }

    fn propagate(
        &mut self,
        second: u64,
        universe: &IdSet,
        apply: fn(&mut IdPairSecond, u64) -> Result<()>,
    ) -> Result<bool> {
        if self.first_complements.is_empty() {
            return Ok(false);
        }
        // Logical sizes are unchanged: the universe and each physical set
        // grow or shrink together.
        let firsts: Vec<u64> = self.first_complements.iter().copied().collect();
        for first in firsts {
            let Some(set) = self.map.get_mut(&first) else {
                return Err(StoreError::ComplementPropagation(format!(
                    "complement key {first} has no membership set"
                )));
            };
            let before_physical = set.physical_len();
            apply(set, second)?;
            set.rebalance(universe, self.threshold);
            self.physical_len = self.physical_len + set.physical_len() - before_physical;
            if !set.is_complement() {
                self.first_complements.remove(&first);
                if set.physical_len() == 0 {
                    self.map.remove(&first);
                }
            }
        }
        Ok(true)
    }

    /// Toggle every diff pair, then rebalance and recompute aggregates once.
    pub fn replay(&mut self, diff: &IdPairDiff, universe: &IdSet) {
        for (first, seconds) in diff.iter() {
            let set = self.map.entry(first).or_default();
            for &second in seconds {
                set.toggle_physical(second);
            }
        }
        self.rebalance_all(universe);
    }

    fn rebalance_all(&mut self, universe: &IdSet) {
        let threshold = self.threshold;
        self.map.retain(|_, set| {
            set.rebalance(universe, threshold);
            set.is_complement() || set.physical_len() > 0
        });
        self.recompute(universe);
    }

    fn recompute(&mut self, universe: &IdSet) {
        self.len = 0;
        self.physical_len = 0;
        self.first_complements.clear();
        for (&first, set) in &self.map {
            self.len += set.len(universe.len());
            self.physical_len += set.physical_len();
            if set.is_complement() {
                self.first_complements.insert(first);
            }
        }
    }

    /// Serialize as `{first}{C|N}{count}{ids}` per non-empty key.
    pub fn encode(&self, universe: &IdSet, with_sentinel: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity((self.map.len() * 3 + self.physical_len) * 8);
        for (&first, set) in &self.map {
            if set.len(universe.len()) == 0 {
                continue;
            }
            put_u64(&mut buf, first);
            put_u8(&mut buf, set.complement_indicator());
            put_u64(&mut buf, set.physical_len() as u64);
            for &id in set.physical() {
                put_u64(&mut buf, id);
            }
        }
        if with_sentinel {
            put_u64(&mut buf, SENTINEL_ID);
            put_u8(&mut buf, DIRECT_BYTE);
            put_u64(&mut buf, 1);
            put_u64(&mut buf, SENTINEL_ID);
        }
        buf
    }

    /// Parse a main file. Returns the container and whether the sentinel
    /// record was present.
    pub fn decode(bytes: &[u8], universe: &IdSet, threshold: f64) -> Result<(Self, bool)> {
        let mut container = Self::new(threshold);
        let mut sentinel = false;
        let mut reader = ByteReader::new(bytes);
        let format = |e: crate::codec::Truncated| StoreError::InvalidFormat(e.to_string());

        while !reader.is_empty() {
            let first = reader.read_u64().map_err(format)?;
            let indicator = reader.read_u8().map_err(format)?;
            let complement = match indicator {
                COMPLEMENT_BYTE => true,
                DIRECT_BYTE => false,
                other => {
                    return Err(StoreError::InvalidFormat(format!(
                        "bad complement indicator 0x{other:02x} at byte {}",
                        reader.offset() - 1
                    )))
                }
            };
            let count = reader.read_u64().map_err(format)?;
            let mut physical = IdSet::new();
            for _ in 0..count {
                physical.insert(reader.read_u64().map_err(format)?);
            }
            if first == SENTINEL_ID {
                sentinel = true;
                continue;
            }
            container.map.insert(first, IdPairSecond::from_parts(physical, complement));
        }
        container.recompute(universe);
        Ok((container, sentinel))
    }
}
