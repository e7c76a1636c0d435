//! Scalar shards: a plain id set, used for the tag and taggable universes.

use std::collections::HashSet;

use crate::codec::{decode_ids, put_u64, ID_WIDTH};
use crate::error::{Result, StoreError};
use crate::relation::{IdSet, SENTINEL_ID};

use super::shard::{Shard, ShardContents, ShardDiff, Toggled};

/// A universe shard. Files are flat sequences of 8-byte ids.
pub type SingleShard = Shard<IdSet>;

fn encode_set(set: &IdSet, with_sentinel: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity((set.len() + 1) * 8);
    for &id in set {
        put_u64(&mut buf, id);
    }
    if with_sentinel {
        put_u64(&mut buf, SENTINEL_ID);
    }
    buf
}

fn decode_set(bytes: &[u8]) -> Result<(IdSet, bool)> {
    if bytes.len() % ID_WIDTH != 0 {
        return Err(StoreError::InvalidFormat(format!(
            "id file length {} is not a multiple of {}",
            bytes.len(),
            ID_WIDTH
        )));
    }
    let mut set = IdSet::new();
    let mut sentinel = false;
    for id in decode_ids(bytes)? {
        if id == SENTINEL_ID {
            sentinel = !sentinel;
        } else if !set.insert(id) {
            set.remove(&id);
        }
    }
    Ok((set, sentinel))
}

impl ShardDiff for IdSet {
    type Item = u64;

    fn toggle(&mut self, item: u64) -> Toggled {
        if HashSet::remove(self, &item) {
            Toggled::Erased
        } else {
            HashSet::insert(self, item);
            Toggled::Inserted
        }
    }

    fn is_empty(&self) -> bool {
        HashSet::is_empty(self)
    }

    fn clear(&mut self) {
        HashSet::clear(self)
    }

    fn encode_diff(&self, with_sentinel: bool) -> Vec<u8> {
        encode_set(self, with_sentinel)
    }

    fn decode_diff(bytes: &[u8]) -> Result<(Self, bool)> {
        decode_set(bytes)
    }
}

impl ShardContents for IdSet {
    type Item = u64;
    type Universe = ();
    type Options = ();
    type Diff = IdSet;

    fn empty(_options: ()) -> Self {
        IdSet::new()
    }

    fn len(&self) -> usize {
        HashSet::len(self)
    }

    fn contains(&self, item: u64, _universe: &()) -> bool {
        HashSet::contains(self, &item)
    }

    fn insert(&mut self, item: u64, _universe: &()) -> bool {
        HashSet::insert(self, item)
    }

    fn remove(&mut self, item: u64, _universe: &()) -> bool {
        HashSet::remove(self, &item)
    }

    fn replay(&mut self, diff: &IdSet, _universe: &()) {
        for &id in diff {
            ShardDiff::toggle(self, id);
        }
    }

    fn encode(&self, _universe: &(), with_sentinel: bool) -> Vec<u8> {
        encode_set(self, with_sentinel)
    }

    fn decode(bytes: &[u8], _options: (), _universe: &()) -> Result<(Self, bool)> {
        decode_set(bytes)
    }
}
