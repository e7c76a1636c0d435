//! Shard persistence and recovery.
//!
//! A shard owns one logical collection and persists it as two files:
//! a main snapshot (`bucket.tbd`) and a diff of toggles made since the
//! snapshot was written (`bucket.ta`).
//!
//! The manifest records each shard's expected size. On first access the
//! main file is read; if its size matches, loading stops. Otherwise the
//! diff is replayed and the size must match afterwards, or the shard is
//! reported as corrupted. A successful replay is written back at once so
//! the same diff is never replayed twice.
//!
//! Mutations that change contents but return the size to what the main
//! file would decode to would hide the diff from that check. `diff_ahead`
//! toggles a reserved sentinel entry in that case so the sizes differ
//! again. The sentinel is tracked beside the contents and never reported.
//!
//! For contents read against a universe, the main file's decoded size
//! moves with the universe, so the comparison uses `synced_len` rather
//! than the size recorded when the file was written.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::durable::{read_optional, remove_if_exists, write_durably};
use crate::error::{Result, StoreError};

/// Main snapshot file name inside a shard directory.
pub const MAIN_FILE_NAME: &str = "bucket.tbd";
/// Diff file name inside a shard directory.
pub const DIFF_FILE_NAME: &str = "bucket.ta";

// ── Capabilities ─────────────────────────────────────────────────────

/// Outcome of toggling one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    Inserted,
    Erased,
}

impl Toggled {
    pub fn from_present(present: bool) -> Self {
        if present {
            Toggled::Inserted
        } else {
            Toggled::Erased
        }
    }
}

/// Pending toggles recorded in a shard's diff file.
pub trait ShardDiff: Default {
    type Item: Copy;

    fn toggle(&mut self, item: Self::Item) -> Toggled;

    fn is_empty(&self) -> bool;

    fn clear(&mut self);

    fn encode_diff(&self, with_sentinel: bool) -> Vec<u8>;

    /// Returns the diff and whether it toggles the sentinel.
    fn decode_diff(bytes: &[u8]) -> Result<(Self, bool)>;
}

/// Logical contents of a shard.
pub trait ShardContents: Sized {
    type Item: Copy + fmt::Debug;
    /// Set the contents are interpreted against (`()` when none).
    type Universe: ?Sized;
    /// Construction parameters carried by the shard.
    type Options: Copy;
    type Diff: ShardDiff<Item = Self::Item>;

    fn empty(options: Self::Options) -> Self;

    fn len(&self) -> usize;

    fn contains(&self, item: Self::Item, universe: &Self::Universe) -> bool;

    fn insert(&mut self, item: Self::Item, universe: &Self::Universe) -> bool;

    fn remove(&mut self, item: Self::Item, universe: &Self::Universe) -> bool;

    /// Flip every entry of `diff` into the contents.
    fn replay(&mut self, diff: &Self::Diff, universe: &Self::Universe);

    fn encode(&self, universe: &Self::Universe, with_sentinel: bool) -> Vec<u8>;

    /// Returns the contents and whether the sentinel was stored.
    fn decode(
        bytes: &[u8],
        options: Self::Options,
        universe: &Self::Universe,
    ) -> Result<(Self, bool)>;

    /// Called whenever the contents match the main file.
    fn mark_synced(&mut self, _universe: &Self::Universe) {}

    /// Size the main file would decode to against `universe`, given
    /// `recorded`, its size when last synced.
    fn synced_len(&self, recorded: usize, _universe: &Self::Universe) -> usize {
        recorded
    }
}

// ── Shard ────────────────────────────────────────────────────────────

pub struct Shard<C: ShardContents> {
    dir: PathBuf,
    main_path: PathBuf,
    diff_path: PathBuf,
    /// Manifest size until loaded, then the size of the main file.
    starting_size: usize,
    loaded: bool,
    contents: C,
    diff: C::Diff,
    sentinel: bool,
    diff_sentinel: bool,
    contents_dirty: bool,
    diff_dirty: bool,
    options: C::Options,
    rename_retries: u32,
}

impl<C: ShardContents> Shard<C> {
    /// Create an unloaded shard. Nothing is read until first access.
    pub fn new(dir: PathBuf, starting_size: usize, options: C::Options, rename_retries: u32) -> Self {
        Self {
            main_path: dir.join(MAIN_FILE_NAME),
            diff_path: dir.join(DIFF_FILE_NAME),
            dir,
            starting_size,
            loaded: false,
            contents: C::empty(options),
            diff: C::Diff::default(),
            sentinel: false,
            diff_sentinel: false,
            contents_dirty: false,
            diff_dirty: false,
            options,
            rename_retries,
        }
    }

    /// A shard that ignores whatever is on disk and starts empty. Its
    /// first `write` replaces any stale files.
    pub fn new_empty(dir: PathBuf, options: C::Options, rename_retries: u32) -> Self {
        let mut shard = Self::new(dir, 0, options, rename_retries);
        shard.loaded = true;
        shard.contents_dirty = true;
        shard
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_dirty(&self) -> bool {
        self.contents_dirty || self.diff_dirty
    }

    /// Size including the sentinel, as compared at load time.
    #[inline]
    fn raw_len(&self) -> usize {
        self.contents.len() + usize::from(self.sentinel)
    }

    /// Size to record in the manifest.
    pub fn recorded_len(&self) -> usize {
        if self.loaded {
            self.raw_len()
        } else {
            self.starting_size
        }
    }

    /// Contents, if the shard has been loaded.
    pub fn loaded_contents(&self) -> Option<&C> {
        self.loaded.then_some(&self.contents)
    }

    /// Contents as held in memory; empty until loaded.
    pub fn current(&self) -> &C {
        &self.contents
    }

    /// Load if needed and borrow the contents.
    pub fn contents(&mut self, universe: &C::Universe) -> Result<&C> {
        self.load(universe)?;
        Ok(&self.contents)
    }

    /// Mutable access for changes made outside `insert`, `remove` and
    /// `toggle`; the caller records them with `record_diff`. Marks the
    /// contents dirty. The shard must be loaded.
    pub(crate) fn contents_mut(&mut self) -> &mut C {
        debug_assert!(self.loaded, "contents_mut on unloaded shard {}", self.dir.display());
        self.contents_dirty = true;
        &mut self.contents
    }

    pub fn load(&mut self, universe: &C::Universe) -> Result<()> {
        if self.loaded {
            return Ok(());
        }

        let (contents, sentinel) = match read_optional(&self.main_path)? {
            Some(bytes) => C::decode(&bytes, self.options, universe)?,
            None => (C::empty(self.options), false),
        };
        self.contents = contents;
        self.sentinel = sentinel;

        if self.raw_len() == self.starting_size {
            self.contents.mark_synced(universe);
            self.loaded = true;
            return Ok(());
        }

        tracing::warn!(
            "shard {}: main file has {} entries, manifest expects {}; replaying diff",
            self.dir.display(),
            self.raw_len(),
            self.starting_size
        );
        let (diff, diff_sentinel) = match read_optional(&self.diff_path)? {
            Some(bytes) => C::Diff::decode_diff(&bytes)?,
            None => (C::Diff::default(), false),
        };
        self.contents.replay(&diff, universe);
        if diff_sentinel {
            self.sentinel = !self.sentinel;
        }

        if self.raw_len() != self.starting_size {
            return Err(StoreError::ShardCorrupted {
                shard: self.dir.clone(),
                expected: self.starting_size,
                actual: self.raw_len(),
            });
        }

        self.loaded = true;
        self.contents_dirty = true;
        self.write(universe)
    }

    pub fn contains(&mut self, item: C::Item, universe: &C::Universe) -> Result<bool> {
        self.load(universe)?;
        Ok(self.contents.contains(item, universe))
    }

    pub fn insert(&mut self, item: C::Item, universe: &C::Universe) -> Result<bool> {
        self.load(universe)?;
        let changed = self.contents.insert(item, universe);
        if changed {
            self.record(item);
        }
        Ok(changed)
    }

    pub fn remove(&mut self, item: C::Item, universe: &C::Universe) -> Result<bool> {
        self.load(universe)?;
        let changed = self.contents.remove(item, universe);
        if changed {
            self.record(item);
        }
        Ok(changed)
    }

    pub fn toggle(&mut self, item: C::Item, universe: &C::Universe) -> Result<Toggled> {
        self.load(universe)?;
        let outcome = if self.contents.contains(item, universe) {
            self.contents.remove(item, universe);
            Toggled::Erased
        } else {
            self.contents.insert(item, universe);
            Toggled::Inserted
        };
        self.record(item);
        Ok(outcome)
    }

    fn record(&mut self, item: C::Item) {
        self.contents_dirty = true;
        self.record_diff(item);
    }

    /// Toggle `item` in the diff only, for changes already applied to the
    /// contents through `contents_mut`.
    pub(crate) fn record_diff(&mut self, item: C::Item) {
        self.diff.toggle(item);
        self.diff_dirty = true;
    }

    /// Persist pending diff entries.
    pub fn diff_ahead(&mut self, universe: &C::Universe) -> Result<()> {
        if !self.diff_dirty {
            return Ok(());
        }
        if self.raw_len() == self.contents.synced_len(self.starting_size, universe) {
            self.sentinel = !self.sentinel;
            self.diff_sentinel = !self.diff_sentinel;
        }
        let bytes = self.diff.encode_diff(self.diff_sentinel);
        write_durably(&self.diff_path, &bytes, self.rename_retries)?;
        tracing::debug!("shard {}: wrote diff ({} bytes)", self.dir.display(), bytes.len());
        self.diff_dirty = false;
        Ok(())
    }

    /// Rewrite the main file from the merged contents and clear the diff.
    pub fn write(&mut self, universe: &C::Universe) -> Result<()> {
        if !self.contents_dirty {
            return Ok(());
        }
        let bytes = self.contents.encode(universe, self.sentinel);
        write_durably(&self.main_path, &bytes, self.rename_retries)?;
        tracing::debug!(
            "shard {}: wrote main file ({} entries)",
            self.dir.display(),
            self.raw_len()
        );
        self.starting_size = self.raw_len();
        self.diff.clear();
        self.diff_sentinel = false;
        self.diff_dirty = false;
        self.contents_dirty = false;
        self.contents.mark_synced(universe);
        Ok(())
    }

    /// Remove the diff file once nothing is pending. Unloaded shards are
    /// left alone because their diff may still be needed for recovery.
    pub fn purge_unused_files(&self) -> Result<()> {
        if !self.loaded || !self.diff.is_empty() || self.diff_sentinel || self.diff_dirty {
            return Ok(());
        }
        if remove_if_exists(&self.diff_path)? {
            tracing::debug!("shard {}: removed diff file", self.dir.display());
        }
        Ok(())
    }
}
