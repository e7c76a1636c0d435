//! perftags: a sharded, crash-recoverable store of tag/taggable pairings
//! with a set-algebra search language.
//!
//! - `relation`: complement-aware membership sets and relation containers
//! - `storage`: shard persistence, diff replay and the manifest
//! - `query`: `SetEvaluation` and the search evaluator
//! - `store`: `TagStore`, which owns the universes and all shards

pub mod codec;
pub mod config;
pub mod durable;
pub mod error;
pub mod query;
pub mod relation;
pub mod storage;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use query::{Aggregate, Comparator, Operand, QueryBuilder, SetEvaluation, SetOp};
pub use store::TagStore;
