//! Pending pair toggles for a pairing shard.

use std::collections::HashMap;

use crate::codec::{put_u64, ByteReader, Truncated};
use crate::error::{Result, StoreError};

use super::{IdPair, IdSet, SENTINEL_ID};

/// Set of `(first, second)` pairs toggled since the last full write.
///
/// Entries carry no representation flag: replay flips membership of each
/// pair against whatever the main contents hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPairDiff {
    map: HashMap<u64, IdSet>,
    len: usize,
}

impl IdPairDiff {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.len = 0;
    }

    /// Toggle a pair. Returns true if the pair is now present.
    pub fn toggle(&mut self, (first, second): IdPair) -> bool {
        let seconds = self.map.entry(first).or_default();
        let present = if seconds.remove(&second) {
            self.len -= 1;
            false
        } else {
            seconds.insert(second);
            self.len += 1;
            true
        };
        if seconds.is_empty() {
            self.map.remove(&first);
        }
        present
    }

    pub fn contains(&self, (first, second): IdPair) -> bool {
        self.map.get(&first).is_some_and(|s| s.contains(&second))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &IdSet)> + '_ {
        self.map.iter().map(|(&first, seconds)| (first, seconds))
    }

    /// Serialize as `{first}{count}{ids}` per key.
    pub fn encode(&self, with_sentinel: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity((self.map.len() * 2 + self.len) * 8);
        for (&first, seconds) in &self.map {
            put_u64(&mut buf, first);
            put_u64(&mut buf, seconds.len() as u64);
            for &second in seconds {
                put_u64(&mut buf, second);
            }
        }
        if with_sentinel {
            put_u64(&mut buf, SENTINEL_ID);
            put_u64(&mut buf, 1);
            put_u64(&mut buf, SENTINEL_ID);
        }
        buf
    }

    /// Parse a diff file. Returns the diff and whether it toggles the sentinel.
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool)> {
        let format = |e: Truncated| StoreError::InvalidFormat(e.to_string());
        let mut diff = Self::default();
        let mut sentinel = false;
        let mut reader = ByteReader::new(bytes);
        while !reader.is_empty() {
            let first = reader.read_u64().map_err(format)?;
            let count = reader.read_u64().map_err(format)?;
            for _ in 0..count {
                let second = reader.read_u64().map_err(format)?;
                if first == SENTINEL_ID {
                    sentinel = !sentinel;
                } else {
                    diff.toggle((first, second));
                }
            }
        }
        Ok((diff, sentinel))
    }
}
