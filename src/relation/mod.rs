//! Relation containers.
//!
//! A relation maps a `first` id to the set of `second` ids it is paired
//! with. Each membership set is stored either directly or as its
//! complement against the second-side universe, whichever is smaller.

pub mod container;
pub mod diff;
pub mod second;

use std::collections::HashSet;

pub use container::IdPairContainer;
pub use diff::IdPairDiff;
pub use second::IdPairSecond;

/// Plain id set. Universes, scalar shards and physical membership
/// contents all use this type.
pub type IdSet = HashSet<u64>;

/// Reserved id that never names a real tag or taggable.
pub const SENTINEL_ID: u64 = u64::MAX;

/// A `(first, second)` pairing.
pub type IdPair = (u64, u64);
