//! Error types for the pairing store

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch input rejected before any mutation was applied.
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// On-disk bytes that do not follow the shard or manifest layout.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error(
        "Shard {} is corrupted: expected {expected} entries, found {actual} after diff replay",
        shard.display()
    )]
    ShardCorrupted {
        shard: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Durable write of {} failed after {attempts} attempts: {source}", path.display())]
    DurableWrite {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Query error at byte {offset}: {reason}")]
    Query { offset: usize, reason: String },

    #[error("Unknown {side} id {id}")]
    UnknownId { side: &'static str, id: u64 },

    /// Universe growth/shrink applied twice to the same complement-mode key.
    #[error("Complement propagation error: {0}")]
    ComplementPropagation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Whether the store can keep serving requests after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::ShardCorrupted { .. }
                | StoreError::DurableWrite { .. }
                | StoreError::ComplementPropagation(_)
        )
    }

    /// Get error code for the command loop
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Malformed(_) => "MALFORMED_INPUT",
            StoreError::Query { .. } => "BAD_QUERY",
            StoreError::UnknownId { .. } => "UNKNOWN_ID",
            StoreError::Transaction(_) => "TRANSACTION",
            StoreError::Closed => "CLOSED",
            StoreError::ShardCorrupted { .. } => "SHARD_CORRUPTED",
            StoreError::DurableWrite { .. } => "DURABLE_WRITE",
            _ => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let corrupted = StoreError::ShardCorrupted {
            shard: PathBuf::from("buckets/tag-bucket"),
            expected: 3,
            actual: 5,
        };
        assert!(corrupted.is_fatal());
        assert_eq!(corrupted.code(), "SHARD_CORRUPTED");

        let malformed = StoreError::Malformed("not a multiple of 8".to_string());
        assert!(!malformed.is_fatal());
        assert_eq!(malformed.code(), "MALFORMED_INPUT");
    }

    #[test]
    fn test_corruption_message_names_shard_and_sizes() {
        let err = StoreError::ShardCorrupted {
            shard: PathBuf::from("buckets/tag-to-taggable-3"),
            expected: 10,
            actual: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("tag-to-taggable-3"));
        assert!(msg.contains("10"));
        assert!(msg.contains("12"));
    }
}
