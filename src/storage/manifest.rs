//! Store manifest (`cache.tdb`).
//!
//! Plain text, whitespace separated:
//!
//! ```text
//! 1
//! <taggables> <tags> <shard_count>
//! <tag_size> <tag_complements> <taggable_size> <taggable_complements>   # shard 0
//! ...
//! ```
//!
//! Sizes are what each shard's files must reconcile to on load.

use std::fmt::Write as _;

use crate::error::{Result, StoreError};

pub const MANIFEST_FILE_NAME: &str = "cache.tdb";
pub const MANIFEST_VERSION: u64 = 1;

/// Recorded state of the two pairing shards sharing one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardSizes {
    pub tag_taggable_size: usize,
    pub tag_taggable_complements: usize,
    pub taggable_tag_size: usize,
    pub taggable_tag_complements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub taggable_count: usize,
    pub tag_count: usize,
    pub shards: Vec<ShardSizes>,
}

impl Manifest {
    /// Manifest of a store with nothing written yet.
    pub fn empty(shard_count: usize) -> Self {
        Self {
            taggable_count: 0,
            tag_count: 0,
            shards: vec![ShardSizes::default(); shard_count],
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{MANIFEST_VERSION}");
        let _ = writeln!(out, "{} {} {}", self.taggable_count, self.tag_count, self.shards.len());
        for s in &self.shards {
            let _ = writeln!(
                out,
                "{} {} {} {}",
                s.tag_taggable_size,
                s.tag_taggable_complements,
                s.taggable_tag_size,
                s.taggable_tag_complements
            );
        }
        out.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::InvalidFormat(format!("manifest is not UTF-8: {e}")))?;
        let mut tokens = text.split_ascii_whitespace();
        let mut next = |what: &str| -> Result<u64> {
            let token = tokens
                .next()
                .ok_or_else(|| StoreError::InvalidFormat(format!("manifest ends before {what}")))?;
            token
                .parse::<u64>()
                .map_err(|e| StoreError::InvalidFormat(format!("manifest {what} {token:?}: {e}")))
        };

        let version = next("version")?;
        if version != MANIFEST_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported manifest version {version}"
            )));
        }
        let taggable_count = next("taggable count")? as usize;
        let tag_count = next("tag count")? as usize;
        let shard_count = next("shard count")? as usize;
        if shard_count == 0 {
            return Err(StoreError::InvalidFormat("manifest shard count is 0".to_string()));
        }

        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(ShardSizes {
                tag_taggable_size: next("tag shard size")? as usize,
                tag_taggable_complements: next("tag shard complements")? as usize,
                taggable_tag_size: next("taggable shard size")? as usize,
                taggable_tag_complements: next("taggable shard complements")? as usize,
            });
        }

        Ok(Self {
            taggable_count,
            tag_count,
            shards,
        })
    }
}
