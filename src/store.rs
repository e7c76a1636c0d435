//! `TagStore`: the tag and taggable universes, both pairing directions,
//! and the manifest that makes them recoverable.
//!
//! Every pairing is stored twice, once keyed by tag (`tag-to-taggable-*`)
//! and once keyed by taggable (`taggable-to-tag-*`). Mutations keep both
//! directions in step.
//!
//! # Write protocol
//!
//! For each mutating call:
//!
//! 1. Apply the change in memory.
//! 2. Re-persist the prior manifest (the one matching every main file).
//! 3. Write the diffs of both universes, then of every pairing shard.
//! 4. Write the new manifest.
//!
//! A crash before step 4 leaves a manifest whose sizes match the main
//! files, so recovery stops at the main files. A crash after it finds
//! sizes that only the diffs reconcile. `flush_files` rewrites the main
//! files and makes the current manifest the new prior one.
//!
//! Between flushes a main file is only rewritten by load-time replay,
//! which reproduces exactly what the manifest in use recorded. Universe
//! changes load every pairing shard of the affected direction first, so
//! that replay always runs against the universe the manifest was written
//! with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::codec::{decode_ids, encode_ids, put_u64, ByteReader, ID_WIDTH};
use crate::config::StoreConfig;
use crate::durable::{read_optional, write_durably};
use crate::error::{Result, StoreError};
use crate::query::search::{search as evaluate_search, RelationLookup};
use crate::relation::{IdSet, SENTINEL_ID};
use crate::storage::{
    tag_taggable_dir, taggable_tag_dir, Manifest, PairingShard, PairingShards, ShardSizes,
    SingleShard, BUCKETS_DIR, MANIFEST_FILE_NAME, TAGGABLE_SHARD_DIR, TAG_SHARD_DIR,
};

/// Which universe an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Taggable,
    Tag,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Taggable => "taggable",
            Side::Tag => "tag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingChange {
    Insert,
    Delete,
    Toggle,
}

/// Borrowed view of the shards involved when one side's universe changes.
struct SideMut<'s> {
    universe: &'s mut SingleShard,
    other_universe: &'s SingleShard,
    /// Relation keyed by this side's ids.
    keyed: &'s mut PairingShards,
    /// Relation whose members are this side's ids.
    membered: &'s mut PairingShards,
}

pub struct TagStore {
    dir: PathBuf,
    manifest_path: PathBuf,
    config: StoreConfig,
    taggables: SingleShard,
    tags: SingleShard,
    tag_taggables: PairingShards,
    taggable_tags: PairingShards,
    /// Manifest bytes matching every main file on disk.
    prior_manifest: Vec<u8>,
    in_transaction: bool,
    closed: bool,
}

// ── Open ─────────────────────────────────────────────────────────────

impl TagStore {
    /// Open the store in `dir`, using `store_config.json` if present.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = StoreConfig::read_from(dir)?.unwrap_or_default();
        Self::open_with_config(dir, config)
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let buckets = dir.join(BUCKETS_DIR);
        let threshold = config.complement_threshold;
        let retries = config.rename_retries;

        let recorded = read_manifest(&manifest_path);
        let fresh = recorded.is_none();
        let (taggables, tags, tag_taggables, taggable_tags, prior_manifest) = match recorded {
            Some((manifest, bytes)) => {
                if manifest.shard_count() != usize::from(config.shard_count) {
                    warn!(
                        "store {} was written with {} shards, ignoring configured {}",
                        dir.display(),
                        manifest.shard_count(),
                        config.shard_count
                    );
                }
                let tag_taggables = manifest
                    .shards
                    .iter()
                    .enumerate()
                    .map(|(i, sizes)| {
                        PairingShard::new(
                            buckets.join(tag_taggable_dir(i)),
                            sizes.tag_taggable_size,
                            sizes.tag_taggable_complements,
                            threshold,
                            retries,
                        )
                    })
                    .collect();
                let taggable_tags = manifest
                    .shards
                    .iter()
                    .enumerate()
                    .map(|(i, sizes)| {
                        PairingShard::new(
                            buckets.join(taggable_tag_dir(i)),
                            sizes.taggable_tag_size,
                            sizes.taggable_tag_complements,
                            threshold,
                            retries,
                        )
                    })
                    .collect();
                (
                    SingleShard::new(
                        buckets.join(TAGGABLE_SHARD_DIR),
                        manifest.taggable_count,
                        (),
                        retries,
                    ),
                    SingleShard::new(buckets.join(TAG_SHARD_DIR), manifest.tag_count, (), retries),
                    PairingShards::new(tag_taggables),
                    PairingShards::new(taggable_tags),
                    bytes,
                )
            }
            None => {
                let shard_count = usize::from(config.shard_count);
                (
                    SingleShard::new_empty(buckets.join(TAGGABLE_SHARD_DIR), (), retries),
                    SingleShard::new_empty(buckets.join(TAG_SHARD_DIR), (), retries),
                    PairingShards::new(
                        (0..shard_count)
                            .map(|i| PairingShard::new_empty(buckets.join(tag_taggable_dir(i)), threshold, retries))
                            .collect(),
                    ),
                    PairingShards::new(
                        (0..shard_count)
                            .map(|i| PairingShard::new_empty(buckets.join(taggable_tag_dir(i)), threshold, retries))
                            .collect(),
                    ),
                    Vec::new(),
                )
            }
        };

        let mut store = Self {
            dir,
            manifest_path,
            config,
            taggables,
            tags,
            tag_taggables,
            taggable_tags,
            prior_manifest,
            in_transaction: false,
            // Drop must not flush a store that failed to open.
            closed: true,
        };

        store.taggables.load(&())?;
        store.tags.load(&())?;
        if fresh {
            store.flush_all()?;
        }
        store.closed = false;

        info!(
            "opened store {} ({} taggables, {} tags, {} shards)",
            store.dir.display(),
            store.taggable_count(),
            store.tag_count(),
            store.shard_count()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Pairing shards per direction. Fixed by the manifest once written.
    pub fn shard_count(&self) -> usize {
        self.tag_taggables.shard_count()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn side_mut(&mut self, side: Side) -> SideMut<'_> {
        match side {
            Side::Taggable => SideMut {
                universe: &mut self.taggables,
                other_universe: &self.tags,
                keyed: &mut self.taggable_tags,
                membered: &mut self.tag_taggables,
            },
            Side::Tag => SideMut {
                universe: &mut self.tags,
                other_universe: &self.taggables,
                keyed: &mut self.tag_taggables,
                membered: &mut self.taggable_tags,
            },
        }
    }
}

/// Read and parse the manifest. Anything unusable means an empty store.
fn read_manifest(path: &Path) -> Option<(Manifest, Vec<u8>)> {
    match read_optional(path) {
        Ok(Some(bytes)) => match Manifest::decode(&bytes) {
            Ok(manifest) => Some((manifest, bytes)),
            Err(e) => {
                warn!("manifest {} is unreadable, starting empty: {e}", path.display());
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("manifest {} could not be read, starting empty: {e}", path.display());
            None
        }
    }
}

// ── Input decoding ───────────────────────────────────────────────────

fn check_ids(ids: &[u64]) -> Result<()> {
    if ids.contains(&SENTINEL_ID) {
        return Err(StoreError::Malformed(format!("id {SENTINEL_ID} is reserved")));
    }
    Ok(())
}

fn check_batch_len(input: &[u8]) -> Result<()> {
    if input.len() % ID_WIDTH != 0 {
        return Err(StoreError::Malformed(format!(
            "batch length {} is not a multiple of {ID_WIDTH}",
            input.len()
        )));
    }
    Ok(())
}

/// `{count}{id × count}`
fn read_id_list(reader: &mut ByteReader<'_>) -> Result<Vec<u64>> {
    let count = reader.read_u64()?;
    if count > (reader.remaining() / ID_WIDTH) as u64 {
        return Err(StoreError::Malformed(format!(
            "list of {count} ids at byte {} exceeds the input",
            reader.offset()
        )));
    }
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(reader.read_u64()?);
    }
    Ok(ids)
}

fn decode_id_batch(input: &[u8]) -> Result<Vec<u64>> {
    check_batch_len(input)?;
    let ids = decode_ids(input)?;
    check_ids(&ids)?;
    Ok(ids)
}

/// `{tag}{n}{taggable × n}` repeated, as `(tag, taggable)` pairs.
fn decode_pairings(input: &[u8]) -> Result<Vec<(u64, u64)>> {
    check_batch_len(input)?;
    let mut reader = ByteReader::new(input);
    let mut pairs = Vec::new();
    while !reader.is_empty() {
        let tag = reader.read_u64()?;
        for taggable in read_id_list(&mut reader)? {
            pairs.push((tag, taggable));
        }
    }
    Ok(pairs)
}

fn dedup(ids: impl IntoIterator<Item = u64>) -> Vec<u64> {
    let mut seen = IdSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

// ── Mutations ────────────────────────────────────────────────────────

impl TagStore {
    pub fn insert_taggables(&mut self, input: &[u8]) -> Result<()> {
        let ids = decode_id_batch(input)?;
        self.insert_ids(Side::Taggable, &ids)
    }

    pub fn delete_taggables(&mut self, input: &[u8]) -> Result<()> {
        let ids = decode_id_batch(input)?;
        self.delete_ids(Side::Taggable, &ids)
    }

    pub fn insert_tags(&mut self, input: &[u8]) -> Result<()> {
        let ids = decode_id_batch(input)?;
        self.insert_ids(Side::Tag, &ids)
    }

    pub fn delete_tags(&mut self, input: &[u8]) -> Result<()> {
        let ids = decode_id_batch(input)?;
        self.delete_ids(Side::Tag, &ids)
    }

    pub fn insert_pairings(&mut self, input: &[u8]) -> Result<()> {
        let pairs = decode_pairings(input)?;
        self.modify_pairings(&pairs, PairingChange::Insert)
    }

    pub fn delete_pairings(&mut self, input: &[u8]) -> Result<()> {
        let pairs = decode_pairings(input)?;
        self.modify_pairings(&pairs, PairingChange::Delete)
    }

    pub fn toggle_pairings(&mut self, input: &[u8]) -> Result<()> {
        let pairs = decode_pairings(input)?;
        self.modify_pairings(&pairs, PairingChange::Toggle)
    }

    pub fn insert_taggable_ids(&mut self, ids: &[u64]) -> Result<()> {
        check_ids(ids)?;
        self.insert_ids(Side::Taggable, ids)
    }

    pub fn delete_taggable_ids(&mut self, ids: &[u64]) -> Result<()> {
        check_ids(ids)?;
        self.delete_ids(Side::Taggable, ids)
    }

    pub fn insert_tag_ids(&mut self, ids: &[u64]) -> Result<()> {
        check_ids(ids)?;
        self.insert_ids(Side::Tag, ids)
    }

    pub fn delete_tag_ids(&mut self, ids: &[u64]) -> Result<()> {
        check_ids(ids)?;
        self.delete_ids(Side::Tag, ids)
    }

    /// Pairs are `(tag, taggable)`.
    pub fn insert_pairing_ids(&mut self, pairs: &[(u64, u64)]) -> Result<()> {
        self.modify_pairings(pairs, PairingChange::Insert)
    }

    pub fn delete_pairing_ids(&mut self, pairs: &[(u64, u64)]) -> Result<()> {
        self.modify_pairings(pairs, PairingChange::Delete)
    }

    pub fn toggle_pairing_ids(&mut self, pairs: &[(u64, u64)]) -> Result<()> {
        self.modify_pairings(pairs, PairingChange::Toggle)
    }

    fn insert_ids(&mut self, side: Side, ids: &[u64]) -> Result<()> {
        self.ensure_open()?;
        let SideMut { universe, membered, .. } = self.side_mut(side);
        let fresh: Vec<u64> = dedup(ids.iter().copied())
            .into_iter()
            .filter(|id| !universe.current().contains(id))
            .collect();

        if !fresh.is_empty() {
            membered.prepare_universe_change(universe.current())?;
            for &id in &fresh {
                universe.insert(id, &())?;
                membered.insert_complement(id, universe.current())?;
            }
        }
        debug!("inserted {} {}s ({} already present)", fresh.len(), side.name(), ids.len() - fresh.len());
        self.persist_mutation()
    }

    /// Remove ids from a universe along with every pairing they take part in.
    fn delete_ids(&mut self, side: Side, ids: &[u64]) -> Result<()> {
        self.ensure_open()?;
        let SideMut {
            universe,
            other_universe,
            keyed,
            membered,
        } = self.side_mut(side);
        let present: Vec<u64> = dedup(ids.iter().copied())
            .into_iter()
            .filter(|id| universe.current().contains(id))
            .collect();

        if !present.is_empty() {
            membered.prepare_universe_change(universe.current())?;
            let other = other_universe.current();
            for &id in &present {
                let partners: Vec<u64> = keyed
                    .for_first(id)
                    .first_contents(id, other)?
                    .map(|second| second.iter(other).collect())
                    .unwrap_or_default();
                for &partner in &partners {
                    keyed.for_first(id).remove((id, partner), other)?;
                    membered.for_first(partner).remove((partner, id), universe.current())?;
                }
                universe.remove(id, &())?;
                membered.delete_complement(id, universe.current())?;
            }
        }
        debug!("deleted {} {}s", present.len(), side.name());
        self.persist_mutation()
    }

    fn modify_pairings(&mut self, pairs: &[(u64, u64)], change: PairingChange) -> Result<()> {
        self.ensure_open()?;
        let taggable_universe = self.taggables.current();
        let tag_universe = self.tags.current();

        for &(tag, taggable) in pairs {
            if !tag_universe.contains(&tag) {
                return Err(StoreError::UnknownId { side: Side::Tag.name(), id: tag });
            }
            if !taggable_universe.contains(&taggable) {
                return Err(StoreError::UnknownId {
                    side: Side::Taggable.name(),
                    id: taggable,
                });
            }
        }

        for &(tag, taggable) in pairs {
            let forward = self.tag_taggables.for_first(tag);
            match change {
                PairingChange::Insert => {
                    forward.insert((tag, taggable), taggable_universe)?;
                    self.taggable_tags.for_first(taggable).insert((taggable, tag), tag_universe)?;
                }
                PairingChange::Delete => {
                    forward.remove((tag, taggable), taggable_universe)?;
                    self.taggable_tags.for_first(taggable).remove((taggable, tag), tag_universe)?;
                }
                PairingChange::Toggle => {
                    forward.toggle((tag, taggable), taggable_universe)?;
                    self.taggable_tags.for_first(taggable).toggle((taggable, tag), tag_universe)?;
                }
            }
        }
        debug!("{change:?} applied to {} pairings", pairs.len());
        self.persist_mutation()
    }

    /// Steps 2-4 of the write protocol.
    fn persist_mutation(&mut self) -> Result<()> {
        self.write_prior_manifest()?;
        self.taggables.diff_ahead(&())?;
        self.tags.diff_ahead(&())?;

        let taggable_universe = self.taggables.current();
        let tag_universe = self.tags.current();
        for shard in self.tag_taggables.iter_mut() {
            shard.diff_ahead(taggable_universe)?;
        }
        for shard in self.taggable_tags.iter_mut() {
            shard.diff_ahead(tag_universe)?;
        }
        self.write_manifest()
    }
}

// ── Manifest ─────────────────────────────────────────────────────────

impl TagStore {
    fn current_manifest(&self) -> Manifest {
        Manifest {
            taggable_count: self.taggables.recorded_len(),
            tag_count: self.tags.recorded_len(),
            shards: self
                .tag_taggables
                .iter()
                .zip(self.taggable_tags.iter())
                .map(|(forward, reverse)| ShardSizes {
                    tag_taggable_size: forward.recorded_len(),
                    tag_taggable_complements: forward.starting_complement_count(),
                    taggable_tag_size: reverse.recorded_len(),
                    taggable_tag_complements: reverse.starting_complement_count(),
                })
                .collect(),
        }
    }

    fn write_prior_manifest(&self) -> Result<()> {
        if self.in_transaction || self.prior_manifest.is_empty() {
            return Ok(());
        }
        write_durably(&self.manifest_path, &self.prior_manifest, self.config.rename_retries)
    }

    fn write_manifest(&self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        let bytes = self.current_manifest().encode();
        write_durably(&self.manifest_path, &bytes, self.config.rename_retries)
    }
}

// ── Reads ────────────────────────────────────────────────────────────

impl TagStore {
    pub fn taggable_count(&self) -> usize {
        self.taggables.current().len()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.current().len()
    }

    pub fn read_taggables(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        Ok(encode_ids(self.taggables.current().iter().copied()))
    }

    pub fn read_tags(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        Ok(encode_ids(self.tags.current().iter().copied()))
    }

    /// Tags paired with `taggable`, unordered.
    pub fn taggable_tags(&mut self, taggable: u64) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let tag_universe = self.tags.current();
        Ok(self
            .taggable_tags
            .for_first(taggable)
            .first_contents(taggable, tag_universe)?
            .map(|second| second.iter(tag_universe).collect())
            .unwrap_or_default())
    }

    /// Taggables paired with `tag`, unordered.
    pub fn tag_taggables(&mut self, tag: u64) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let taggable_universe = self.taggables.current();
        Ok(self
            .tag_taggables
            .for_first(tag)
            .first_contents(tag, taggable_universe)?
            .map(|second| second.iter(taggable_universe).collect())
            .unwrap_or_default())
    }

    pub fn contains_pairing(&mut self, tag: u64, taggable: u64) -> Result<bool> {
        self.ensure_open()?;
        let taggable_universe = self.taggables.current();
        self.tag_taggables.for_first(tag).contains((tag, taggable), taggable_universe)
    }

    /// Input: flat taggable ids. Output per taggable: id, tag count, tags.
    pub fn read_taggables_tags(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let taggables = decode_id_batch(input)?;
        let mut out = Vec::new();
        for taggable in taggables {
            let tags = self.taggable_tags(taggable)?;
            put_u64(&mut out, taggable);
            put_u64(&mut out, tags.len() as u64);
            for tag in tags {
                put_u64(&mut out, tag);
            }
        }
        Ok(out)
    }

    /// Input: `{tag count}{tags}{taggable count}{taggables}`. Output per
    /// taggable: id, count, and those of its tags among the given ones.
    pub fn read_taggables_specified_tags(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        check_batch_len(input)?;
        let mut reader = ByteReader::new(input);
        let specified = dedup(read_id_list(&mut reader)?);
        let taggables = read_id_list(&mut reader)?;
        if !reader.is_empty() {
            return Err(StoreError::Malformed(format!(
                "{} trailing bytes after taggable list",
                reader.remaining()
            )));
        }

        let tag_universe = self.tags.current();
        let mut out = Vec::new();
        for taggable in taggables {
            let matching: Vec<u64> = match self
                .taggable_tags
                .for_first(taggable)
                .first_contents(taggable, tag_universe)?
            {
                Some(second) => specified
                    .iter()
                    .copied()
                    .filter(|&tag| second.contains(tag, tag_universe))
                    .collect(),
                None => Vec::new(),
            };
            put_u64(&mut out, taggable);
            put_u64(&mut out, matching.len() as u64);
            for tag in matching {
                put_u64(&mut out, tag);
            }
        }
        Ok(out)
    }

    /// Evaluate a search expression to the matching taggables.
    pub fn search_ids(&mut self, query: &[u8]) -> Result<IdSet> {
        self.ensure_open()?;
        let taggable_universe = self.taggables.current();
        self.tag_taggables.load_all(taggable_universe)?;
        Ok(evaluate_search(&self.tag_taggables, taggable_universe, query)?.release_result())
    }

    /// Search output: flat 8-byte ids, unordered.
    pub fn search(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        Ok(encode_ids(self.search_ids(query)?))
    }

    /// For each group of tags, how many taggables matching `query` carry
    /// at least one tag of the group. The search runs once.
    pub fn tag_group_taggable_counts(&mut self, groups: &[Vec<u64>], query: &[u8]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let taggable_universe = self.taggables.current();
        let tag_universe = self.tags.current();
        self.tag_taggables.load_all(taggable_universe)?;
        self.taggable_tags.load_all(tag_universe)?;

        let mut tag_groups: HashMap<u64, Vec<usize>> = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for &tag in group {
                let entry = tag_groups.entry(tag).or_default();
                if !entry.contains(&index) {
                    entry.push(index);
                }
            }
        }

        let result = evaluate_search(&self.tag_taggables, taggable_universe, query)?;
        let mut counts = vec![0u64; groups.len()];
        let mut hit = vec![false; groups.len()];
        for taggable in result.iter() {
            let Some(tags) = self.taggable_tags.first_contents(taggable) else {
                continue;
            };
            hit.fill(false);
            if tags.is_complement() {
                for (tag, indices) in &tag_groups {
                    if tags.contains(*tag, tag_universe) {
                        indices.iter().for_each(|&i| hit[i] = true);
                    }
                }
            } else {
                for tag in tags.physical() {
                    if let Some(indices) = tag_groups.get(tag) {
                        indices.iter().for_each(|&i| hit[i] = true);
                    }
                }
            }
            for (count, _) in counts.iter_mut().zip(&hit).filter(|(_, hit)| **hit) {
                *count += 1;
            }
        }
        Ok(counts)
    }

    /// Input: `{group count}{per group: tag count, tags}{search expression}`.
    /// Output: one 8-byte count per group.
    pub fn read_tag_groups_taggable_counts(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut reader = ByteReader::new(input);
        let group_count = reader.read_u64()?;
        if group_count > (reader.remaining() / ID_WIDTH) as u64 {
            return Err(StoreError::Malformed(format!("{group_count} tag groups exceed the input")));
        }
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            groups.push(read_id_list(&mut reader)?);
        }
        let counts = self.tag_group_taggable_counts(&groups, reader.rest())?;
        Ok(encode_ids(counts))
    }
}

// ── Maintenance ──────────────────────────────────────────────────────

impl TagStore {
    /// Rewrite every dirty main file, then the manifest.
    pub fn flush_files(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StoreError::Transaction(
                "flush_files is not allowed inside a transaction".to_string(),
            ));
        }
        self.flush_all()
    }

    fn flush_all(&mut self) -> Result<()> {
        self.taggables.write(&())?;
        self.tags.write(&())?;
        let taggable_universe = self.taggables.current();
        let tag_universe = self.tags.current();
        for shard in self.tag_taggables.iter_mut() {
            shard.write(taggable_universe)?;
        }
        for shard in self.taggable_tags.iter_mut() {
            shard.write(tag_universe)?;
        }

        let bytes = self.current_manifest().encode();
        write_durably(&self.manifest_path, &bytes, self.config.rename_retries)?;
        self.prior_manifest = bytes;
        info!("flushed store {}", self.dir.display());
        Ok(())
    }

    /// Delete diff files that no longer hold pending changes.
    pub fn purge_unused_files(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.taggables.purge_unused_files()?;
        self.tags.purge_unused_files()?;
        for shard in self.tag_taggables.iter().chain(self.taggable_tags.iter()) {
            shard.purge_unused_files()?;
        }
        Ok(())
    }

    /// Suppress manifest writes until `end_transaction`. Diffs are still
    /// written per mutation.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StoreError::Transaction("transaction already open".to_string()));
        }
        self.write_prior_manifest()?;
        self.in_transaction = true;
        debug!("transaction started");
        Ok(())
    }

    pub fn end_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(StoreError::Transaction("no open transaction".to_string()));
        }
        self.in_transaction = false;
        self.write_prior_manifest()?;
        self.write_manifest()?;
        debug!("transaction ended");
        Ok(())
    }

    /// End any open transaction and flush. Later calls fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.in_transaction {
            self.end_transaction()?;
        }
        self.flush_all()?;
        self.closed = true;
        info!("closed store {}", self.dir.display());
        Ok(())
    }
}

impl Drop for TagStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close store {}: {e}", self.dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::MAIN_FILE_NAME;
    use tempfile::TempDir;

    fn sorted(mut ids: Vec<u64>) -> Vec<u64> {
        ids.sort_unstable();
        ids
    }

    fn config() -> StoreConfig {
        StoreConfig::default().with_shard_count(4)
    }

    fn store(dir: &TempDir) -> TagStore {
        TagStore::open_with_config(dir.path(), config()).unwrap()
    }

    #[test]
    fn test_fresh_store_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.shard_count(), 4);
        assert_eq!(store.taggable_count(), 0);
        let bytes = std::fs::read(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        let manifest = Manifest::decode(&bytes).unwrap();
        assert_eq!(manifest, Manifest::empty(4));
    }

    #[test]
    fn test_manifest_shard_count_wins_over_config() {
        let dir = TempDir::new().unwrap();
        store(&dir).close().unwrap();
        let reopened =
            TagStore::open_with_config(dir.path(), StoreConfig::default().with_shard_count(8)).unwrap();
        assert_eq!(reopened.shard_count(), 4);
    }

    #[test]
    fn test_pairing_requires_known_ids() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.insert_tag_ids(&[7]).unwrap();
        let err = store.insert_pairing_ids(&[(7, 100)]).unwrap_err();
        assert!(matches!(err, StoreError::UnknownId { side: "taggable", id: 100 }));
        assert_eq!(err.code(), "UNKNOWN_ID");
    }

    #[test]
    fn test_pairings_are_bidirectional() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.insert_taggable_ids(&[100, 101]).unwrap();
        store.insert_tag_ids(&[7, 8]).unwrap();
        store.insert_pairing_ids(&[(7, 100), (8, 100), (7, 101)]).unwrap();

        assert_eq!(sorted(store.taggable_tags(100).unwrap()), vec![7, 8]);
        assert_eq!(sorted(store.tag_taggables(7).unwrap()), vec![100, 101]);

        store.toggle_pairing_ids(&[(8, 100), (8, 101)]).unwrap();
        assert_eq!(sorted(store.taggable_tags(100).unwrap()), vec![7]);
        assert_eq!(sorted(store.taggable_tags(101).unwrap()), vec![7, 8]);

        store.delete_pairing_ids(&[(7, 101)]).unwrap();
        assert!(!store.contains_pairing(7, 101).unwrap());
        assert_eq!(sorted(store.tag_taggables(7).unwrap()), vec![100]);
    }

    #[test]
    fn test_deleting_tag_cascades_to_both_directions() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        store.insert_tag_ids(&[10, 11]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (11, 2)]).unwrap();

        store.delete_tag_ids(&[10]).unwrap();
        assert_eq!(store.tag_count(), 1);
        assert!(store.taggable_tags(1).unwrap().is_empty());
        assert_eq!(store.taggable_tags(2).unwrap(), vec![11]);
        assert!(store.tag_taggables(10).unwrap().is_empty());
    }

    #[test]
    fn test_universe_growth_keeps_complement_keys_exact() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();

        store.insert_taggable_ids(&[6]).unwrap();
        assert!(!store.contains_pairing(10, 6).unwrap());
        assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3, 4]);

        store.close().unwrap();
        let mut reopened = TagStore::open(dir.path()).unwrap();
        assert_eq!(sorted(reopened.tag_taggables(10).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_malformed_batches_change_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        assert_eq!(store.insert_taggables(&[0u8; 7]).unwrap_err().code(), "MALFORMED_INPUT");
        assert_eq!(
            store.insert_tags(&encode_ids([SENTINEL_ID])).unwrap_err().code(),
            "MALFORMED_INPUT"
        );
        // Pairing list claims two taggables but carries one.
        let input = encode_ids([7, 2, 100]);
        assert_eq!(store.insert_pairings(&input).unwrap_err().code(), "MALFORMED_INPUT");
        assert_eq!(store.taggable_count(), 0);
        assert_eq!(store.tag_count(), 0);
    }

    #[test]
    fn test_read_taggables_specified_tags_filters() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.insert_taggable_ids(&[1, 2]).unwrap();
        store.insert_tag_ids(&[10, 11, 12]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (11, 1), (12, 1)]).unwrap();

        let input = encode_ids([2, 10, 12, 2, 1, 2]);
        let out = decode_ids(&store.read_taggables_specified_tags(&input).unwrap()).unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 2);
        assert_eq!(sorted(out[2..4].to_vec()), vec![10, 12]);
        assert_eq!(&out[4..], &[2, 0]);
    }

    /// Tags 1..=5; taggable 100 carries 1..=4, stored as the complement {5}.
    fn crowded(dir: &TempDir) -> TagStore {
        let mut store = store(dir);
        store.insert_taggable_ids(&[100]).unwrap();
        store.insert_tag_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_pairing_ids(&[(1, 100), (2, 100), (3, 100), (4, 100)]).unwrap();
        store
    }

    #[test]
    fn test_complement_keys_ignore_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let mut store = crowded(&dir);

        let counts = store
            .tag_group_taggable_counts(&[vec![999], vec![1], vec![5]], b"U")
            .unwrap();
        assert_eq!(counts, vec![0, 1, 0]);

        let input = encode_ids([1, 999, 1, 100]);
        let out = decode_ids(&store.read_taggables_specified_tags(&input).unwrap()).unwrap();
        assert_eq!(out, vec![100, 0]);

        // Tag 1 holds every taggable, so it is a complement key too.
        assert!(store.contains_pairing(1, 100).unwrap());
        assert!(!store.contains_pairing(1, 999).unwrap());
        assert!(!store.contains_pairing(1, u64::MAX).unwrap());
    }

    #[test]
    fn test_transaction_rules() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        assert!(matches!(store.end_transaction(), Err(StoreError::Transaction(_))));
        store.begin_transaction().unwrap();
        assert!(matches!(store.begin_transaction(), Err(StoreError::Transaction(_))));
        assert!(matches!(store.flush_files(), Err(StoreError::Transaction(_))));
        store.insert_taggable_ids(&[1]).unwrap();
        store.end_transaction().unwrap();
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.insert_taggable_ids(&[1]), Err(StoreError::Closed)));
        assert!(matches!(store.read_taggables(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_missing_manifest_discards_stale_shards() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = store(&dir);
            store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        }
        std::fs::remove_file(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        let store = TagStore::open_with_config(dir.path(), config()).unwrap();
        assert_eq!(store.taggable_count(), 0);
        let stale = dir.path().join(BUCKETS_DIR).join(TAGGABLE_SHARD_DIR).join(MAIN_FILE_NAME);
        assert_eq!(std::fs::read(stale).unwrap().len(), 0);
    }
}
