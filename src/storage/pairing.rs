//! Pairing shards: relation containers persisted through `Shard`.
//!
//! Besides the usual mutations, a pairing shard follows changes to its
//! second-side universe. Keys stored as complements must record a new
//! universe id as a non-member (and forget a removed one), otherwise the
//! id would read as contained.
//!
//! The main file is only rewritten by a flush. Complement keys of the main
//! file would read a new universe id as a member when decoded against the
//! grown universe, so propagation records `(key, id)` in the diff for each
//! of them and replay flips it back out.

use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::query::search::RelationLookup;
use crate::relation::{IdPair, IdPairContainer, IdPairDiff, IdPairSecond, IdSet};

use super::shard::{Shard, ShardContents, ShardDiff, Toggled};

impl ShardDiff for IdPairDiff {
    type Item = IdPair;

    fn toggle(&mut self, item: IdPair) -> Toggled {
        Toggled::from_present(IdPairDiff::toggle(self, item))
    }

    fn is_empty(&self) -> bool {
        IdPairDiff::is_empty(self)
    }

    fn clear(&mut self) {
        IdPairDiff::clear(self)
    }

    fn encode_diff(&self, with_sentinel: bool) -> Vec<u8> {
        self.encode(with_sentinel)
    }

    fn decode_diff(bytes: &[u8]) -> Result<(Self, bool)> {
        IdPairDiff::decode(bytes)
    }
}

impl ShardContents for IdPairContainer {
    type Item = IdPair;
    type Universe = IdSet;
    /// Complement threshold.
    type Options = f64;
    type Diff = IdPairDiff;

    fn empty(threshold: f64) -> Self {
        IdPairContainer::new(threshold)
    }

    fn len(&self) -> usize {
        IdPairContainer::len(self)
    }

    fn contains(&self, item: IdPair, universe: &IdSet) -> bool {
        IdPairContainer::contains(self, item, universe)
    }

    fn insert(&mut self, item: IdPair, universe: &IdSet) -> bool {
        IdPairContainer::insert(self, item, universe)
    }

    fn remove(&mut self, item: IdPair, universe: &IdSet) -> bool {
        IdPairContainer::remove(self, item, universe)
    }

    fn replay(&mut self, diff: &IdPairDiff, universe: &IdSet) {
        IdPairContainer::replay(self, diff, universe)
    }

    fn encode(&self, universe: &IdSet, with_sentinel: bool) -> Vec<u8> {
        IdPairContainer::encode(self, universe, with_sentinel)
    }

    fn decode(bytes: &[u8], threshold: f64, universe: &IdSet) -> Result<(Self, bool)> {
        IdPairContainer::decode(bytes, universe, threshold)
    }

    fn mark_synced(&mut self, universe: &IdSet) {
        IdPairContainer::mark_synced(self, universe)
    }

    fn synced_len(&self, recorded: usize, universe: &IdSet) -> usize {
        IdPairContainer::synced_len(self, recorded, universe)
    }
}

// ── Pairing Shard ────────────────────────────────────────────────────

/// One direction of the relation for ids routed to this shard.
pub struct PairingShard {
    shard: Shard<IdPairContainer>,
    /// Complement keys in the main file, per the manifest. Replaced by the
    /// container's synced count once loaded.
    starting_complement_count: usize,
}

impl PairingShard {
    pub fn new(
        dir: PathBuf,
        starting_size: usize,
        starting_complement_count: usize,
        threshold: f64,
        rename_retries: u32,
    ) -> Self {
        Self {
            shard: Shard::new(dir, starting_size, threshold, rename_retries),
            starting_complement_count,
        }
    }

    pub fn new_empty(dir: PathBuf, threshold: f64, rename_retries: u32) -> Self {
        Self {
            shard: Shard::new_empty(dir, threshold, rename_retries),
            starting_complement_count: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.shard.is_loaded()
    }

    pub fn load(&mut self, universe: &IdSet) -> Result<()> {
        self.shard.load(universe)
    }

    pub fn recorded_len(&self) -> usize {
        self.shard.recorded_len()
    }

    pub fn starting_complement_count(&self) -> usize {
        match self.shard.loaded_contents() {
            Some(contents) => contents.synced_complement_count(),
            None => self.starting_complement_count,
        }
    }

    pub fn insert(&mut self, pair: IdPair, universe: &IdSet) -> Result<bool> {
        self.shard.insert(pair, universe)
    }

    pub fn remove(&mut self, pair: IdPair, universe: &IdSet) -> Result<bool> {
        self.shard.remove(pair, universe)
    }

    pub fn toggle(&mut self, pair: IdPair, universe: &IdSet) -> Result<Toggled> {
        self.shard.toggle(pair, universe)
    }

    pub fn contains(&mut self, pair: IdPair, universe: &IdSet) -> Result<bool> {
        self.shard.contains(pair, universe)
    }

    pub fn first_contents(&mut self, first: u64, universe: &IdSet) -> Result<Option<&IdPairSecond>> {
        Ok(self.shard.contents(universe)?.first_contents(first))
    }

    pub fn loaded_first_contents(&self, first: u64) -> Option<&IdPairSecond> {
        self.shard.loaded_contents()?.first_contents(first)
    }

    /// Follow an id added to the second-side universe. `universe` already
    /// contains it.
    pub fn insert_complement(&mut self, second: u64, universe: &IdSet) -> Result<()> {
        self.propagate(second, universe, IdPairContainer::insert_complement)
    }

    /// Follow an id removed from the second-side universe. `universe` no
    /// longer contains it.
    pub fn delete_complement(&mut self, second: u64, universe: &IdSet) -> Result<()> {
        self.propagate(second, universe, IdPairContainer::delete_complement)
    }

    fn propagate(
        &mut self,
        second: u64,
        universe: &IdSet,
        apply: fn(&mut IdPairContainer, u64, &IdSet) -> Result<bool>,
    ) -> Result<()> {
        let Some(contents) = self.shard.loaded_contents() else {
            return Err(StoreError::ComplementPropagation(format!(
                "shard {} was not loaded before the universe changed",
                self.shard.dir().display()
            )));
        };
        // Complement keys of the main file, whatever their mode in memory.
        let synced: Vec<u64> = contents.synced_complement_keys().collect();
        if !contents.first_complements().is_empty() {
            apply(self.shard.contents_mut(), second, universe)?;
        }
        for first in synced {
            self.shard.record_diff((first, second));
        }
        Ok(())
    }

    pub fn diff_ahead(&mut self, universe: &IdSet) -> Result<()> {
        self.shard.diff_ahead(universe)
    }

    pub fn write(&mut self, universe: &IdSet) -> Result<()> {
        self.shard.write(universe)
    }

    pub fn purge_unused_files(&self) -> Result<()> {
        self.shard.purge_unused_files()
    }
}

// ── Shard Routing ────────────────────────────────────────────────────

/// All pairing shards of one direction, routed by `first % shard_count`.
pub struct PairingShards {
    shards: Vec<PairingShard>,
}

impl PairingShards {
    pub fn new(shards: Vec<PairingShard>) -> Self {
        assert!(!shards.is_empty(), "shard_count must be > 0");
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    pub fn index_for(&self, first: u64) -> usize {
        (first % self.shards.len() as u64) as usize
    }

    pub fn for_first(&mut self, first: u64) -> &mut PairingShard {
        let idx = self.index_for(first);
        &mut self.shards[idx]
    }

    pub fn get(&self, first: u64) -> &PairingShard {
        &self.shards[self.index_for(first)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PairingShard> {
        self.shards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PairingShard> {
        self.shards.iter_mut()
    }

    pub fn load_all(&mut self, universe: &IdSet) -> Result<()> {
        for shard in &mut self.shards {
            shard.load(universe)?;
        }
        Ok(())
    }

    /// Load every shard while the universe still matches the one their
    /// files were written against. Must run before the universe changes.
    pub fn prepare_universe_change(&mut self, universe: &IdSet) -> Result<()> {
        self.load_all(universe)
    }

    pub fn insert_complement(&mut self, second: u64, universe: &IdSet) -> Result<()> {
        for shard in &mut self.shards {
            shard.insert_complement(second, universe)?;
        }
        Ok(())
    }

    pub fn delete_complement(&mut self, second: u64, universe: &IdSet) -> Result<()> {
        for shard in &mut self.shards {
            shard.delete_complement(second, universe)?;
        }
        Ok(())
    }
}

impl RelationLookup for PairingShards {
    fn first_contents(&self, first: u64) -> Option<&IdPairSecond> {
        self.get(first).loaded_first_contents(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::MAIN_FILE_NAME;
    use std::path::Path;

    const THRESHOLD: f64 = 0.6;

    fn universe(ids: impl IntoIterator<Item = u64>) -> IdSet {
        ids.into_iter().collect()
    }

    fn open(dir: &Path, size: usize, complements: usize) -> PairingShard {
        PairingShard::new(dir.join("tag-to-taggable-0"), size, complements, THRESHOLD, 3)
    }

    #[test]
    fn test_pairing_roundtrip_keeps_complement_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = universe(1..=5);
        let mut shard = open(dir.path(), 0, 0);
        for id in 1..=4 {
            shard.insert((10, id), &u).unwrap();
        }
        shard.write(&u).unwrap();
        assert_eq!(shard.recorded_len(), 4);
        assert_eq!(shard.starting_complement_count(), 1);

        let mut reopened = open(dir.path(), 4, 1);
        let second = reopened.first_contents(10, &u).unwrap().unwrap();
        assert!(second.is_complement());
        assert_eq!(second.physical(), &universe([5]));
    }

    fn main_bytes(dir: &Path) -> Vec<u8> {
        std::fs::read(dir.join("tag-to-taggable-0").join(MAIN_FILE_NAME)).unwrap()
    }

    #[test]
    fn test_growth_on_synced_complement_goes_to_diff() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut u = universe(1..=5);
        let mut shard = open(dir.path(), 0, 0);
        for id in 1..=4 {
            shard.insert((10, id), &u).unwrap();
        }
        shard.write(&u).unwrap();
        let main = main_bytes(dir.path());
        drop(shard);

        // Fresh process: shard is lazily unloaded.
        let mut shard = open(dir.path(), 4, 1);
        shard.load(&u).unwrap();
        u.insert(6);
        shard.insert_complement(6, &u).unwrap();
        shard.diff_ahead(&u).unwrap();
        let recorded = shard.recorded_len();
        // The main file alone now decodes to 5 entries against the grown
        // universe, so 4 already differs without a sentinel.
        assert_eq!(recorded, 4);
        assert_eq!(main_bytes(dir.path()), main, "main file must not change");
        drop(shard);

        let mut reopened = open(dir.path(), recorded, 1);
        assert!(!reopened.contains((10, 6), &u).unwrap());
        assert!(reopened.contains((10, 4), &u).unwrap());
        assert_eq!(reopened.recorded_len(), 4);
    }

    #[test]
    fn test_growth_matching_main_size_sets_sentinel() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut u = universe(1..=5);
        let mut shard = open(dir.path(), 0, 0);
        for id in 1..=4 {
            shard.insert((10, id), &u).unwrap();
        }
        shard.write(&u).unwrap();

        // Against {1..6} the main file reads as {1,2,3,4,6}: five entries.
        // Memory holds {1..4} plus (11, 1), also five.
        u.insert(6);
        shard.insert_complement(6, &u).unwrap();
        shard.insert((11, 1), &u).unwrap();
        shard.diff_ahead(&u).unwrap();
        let recorded = shard.recorded_len();
        assert_eq!(recorded, 6, "sentinel must make the size differ");
        drop(shard);

        let mut reopened = open(dir.path(), recorded, 1);
        assert!(!reopened.contains((10, 6), &u).unwrap());
        assert!(reopened.contains((11, 1), &u).unwrap());
        assert_eq!(reopened.recorded_len(), 6);
    }

    #[test]
    fn test_unloaded_shard_rejects_propagation() {
        let dir = tempfile::TempDir::new().unwrap();
        let u = universe(1..=6);
        let mut shard = open(dir.path(), 0, 0);
        assert!(matches!(
            shard.insert_complement(6, &u),
            Err(StoreError::ComplementPropagation(_))
        ));
    }

    #[test]
    fn test_routing_by_modulo() {
        let dir = tempfile::TempDir::new().unwrap();
        let shards: Vec<PairingShard> = (0..4)
            .map(|i| PairingShard::new(dir.path().join(format!("s{i}")), 0, 0, THRESHOLD, 3))
            .collect();
        let shards = PairingShards::new(shards);
        assert_eq!(shards.index_for(9), 1);
        assert_eq!(shards.index_for(12), 0);
        assert_eq!(shards.shard_count(), 4);
    }
}
