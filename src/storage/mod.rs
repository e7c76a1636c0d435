//! On-disk storage: generic shards, universe shards, pairing shards and
//! the manifest that ties their sizes together.
//!
//! # Storage Layout
//!
//! ```text
//! <store>/
//! +-- cache.tdb                     # Manifest
//! +-- store_config.json             # StoreConfig (optional)
//! +-- buckets/
//!     +-- taggable-bucket/          # Taggable universe
//!     |   +-- bucket.tbd            # Main snapshot
//!     |   +-- bucket.ta             # Diff
//!     +-- tag-bucket/               # Tag universe
//!     +-- tag-to-taggable-0/
//!     +-- taggable-to-tag-0/
//!     +-- ...
//! ```

pub mod manifest;
pub mod pairing;
pub mod shard;
pub mod single;

pub use manifest::{Manifest, ShardSizes, MANIFEST_FILE_NAME};
pub use pairing::{PairingShard, PairingShards};
pub use shard::{Shard, ShardContents, ShardDiff, Toggled};
pub use single::SingleShard;

pub const BUCKETS_DIR: &str = "buckets";
pub const TAGGABLE_SHARD_DIR: &str = "taggable-bucket";
pub const TAG_SHARD_DIR: &str = "tag-bucket";

pub fn tag_taggable_dir(index: usize) -> String {
    format!("tag-to-taggable-{index}")
}

pub fn taggable_tag_dir(index: usize) -> String {
    format!("taggable-to-tag-{index}")
}
