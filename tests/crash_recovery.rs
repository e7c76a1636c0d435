//! Integration test: crash recovery and persistence semantics.
//!
//! A crash is simulated with `std::mem::forget`, which skips the flush
//! `Drop` would otherwise perform. Validates that:
//! - Mutations survive a crash through their diffs
//! - A missing main file is rebuilt from its diff
//! - Size-preserving changes are not hidden from recovery
//! - Universe growth over complement keys is replayed from the diff
//! - A crash inside a transaction rolls back to the last flush
//! - Size mismatches that a diff cannot explain are fatal

use std::path::{Path, PathBuf};

use perftags::storage::shard::MAIN_FILE_NAME;
use perftags::storage::{tag_taggable_dir, BUCKETS_DIR, MANIFEST_FILE_NAME};
use perftags::{StoreConfig, StoreError, TagStore};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SHARDS: u16 = 4;

fn open(dir: &Path) -> TagStore {
    TagStore::open_with_config(dir, StoreConfig::default().with_shard_count(SHARDS)).unwrap()
}

/// Drop the store without flushing, as if the process died.
fn crash(store: TagStore) {
    std::mem::forget(store);
}

fn sorted(mut ids: Vec<u64>) -> Vec<u64> {
    ids.sort_unstable();
    ids
}

fn tag_shard_main(dir: &Path, tag: u64) -> PathBuf {
    dir.join(BUCKETS_DIR)
        .join(tag_taggable_dir((tag % u64::from(SHARDS)) as usize))
        .join(MAIN_FILE_NAME)
}

// ---------------------------------------------------------------------------
// Tests: Diff Replay
// ---------------------------------------------------------------------------

#[test]
fn unflushed_mutations_survive_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        store.insert_tag_ids(&[10, 11]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (11, 3)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 3);
    assert_eq!(store.tag_count(), 2);
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2]);
    assert_eq!(store.taggable_tags(3).unwrap(), vec![11]);
}

#[test]
fn missing_main_file_rebuilt_from_diff() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 3)]).unwrap();
        crash(store);
    }
    std::fs::remove_file(tag_shard_main(dir.path(), 10)).unwrap();

    let mut store = open(dir.path());
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 3]);
}

#[test]
fn size_preserving_toggle_is_recovered() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1)]).unwrap();
        store.flush_files().unwrap();

        // Tag 10 keeps one taggable, but a different one.
        store.toggle_pairing_ids(&[(10, 1), (10, 2)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.tag_taggables(10).unwrap(), vec![2]);
    assert!(store.taggable_tags(1).unwrap().is_empty());
    assert_eq!(store.taggable_tags(2).unwrap(), vec![10]);
}

#[test]
fn recovered_store_can_crash_again() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1)]).unwrap();
        crash(store);
    }
    {
        // Loading replays the diff and rewrites the main file.
        let mut store = open(dir.path());
        assert_eq!(store.tag_taggables(10).unwrap(), vec![1]);
        store.insert_pairing_ids(&[(10, 2)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2]);
}

#[test]
fn flushed_then_mutated_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4]).unwrap();
        store.insert_tag_ids(&[10, 11]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (11, 2)]).unwrap();
        store.flush_files().unwrap();
        store.delete_taggable_ids(&[1]).unwrap();
        store.insert_pairing_ids(&[(11, 3)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 3);
    assert!(store.tag_taggables(10).unwrap().is_empty());
    assert_eq!(sorted(store.tag_taggables(11).unwrap()), vec![2, 3]);
}

// ---------------------------------------------------------------------------
// Tests: Complement Keys
// ---------------------------------------------------------------------------

#[test]
fn universe_growth_over_complement_key_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        // Four of five taggables: stored as the complement {5}.
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();

        store.insert_taggable_ids(&[6]).unwrap();
        assert!(!store.contains_pairing(10, 6).unwrap());
        store.insert_pairing_ids(&[(10, 6)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 6);
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3, 4, 6]);
    assert!(!store.contains_pairing(10, 5).unwrap());
}

#[test]
fn universe_shrink_over_complement_key_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();

        store.delete_taggable_ids(&[5, 4]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 3);
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3]);
}

#[test]
fn repeated_growth_over_complement_key_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();

        store.insert_taggable_ids(&[6]).unwrap();
        store.insert_taggable_ids(&[7]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 7);
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3, 4]);
    assert!(!store.contains_pairing(10, 6).unwrap());
    assert!(!store.contains_pairing(10, 7).unwrap());
}

#[test]
fn crash_while_restoring_flushed_manifest_keeps_complement_key() {
    let dir = TempDir::new().unwrap();
    let flushed = {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();
        let flushed = std::fs::read(dir.path().join(MANIFEST_FILE_NAME)).unwrap();

        store.insert_taggable_ids(&[6]).unwrap();
        store.insert_taggable_ids(&[7]).unwrap();
        crash(store);
        flushed
    };
    // The next mutation would have re-persisted the flushed manifest
    // before its diffs; die right after that step.
    std::fs::write(dir.path().join(MANIFEST_FILE_NAME), flushed).unwrap();

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 5);
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3, 4]);
    assert!(!store.contains_pairing(10, 5).unwrap());
}

#[test]
fn growth_matching_flushed_size_is_not_mistaken_for_main_file() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3, 4, 5]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2), (10, 3), (10, 4)]).unwrap();
        store.flush_files().unwrap();

        // Against {1..6} the flushed main file reads as {1,2,3,4,6}. End
        // with {1,2,3,5,6}: same size, different members.
        store.insert_taggable_ids(&[6]).unwrap();
        store.insert_pairing_ids(&[(10, 6)]).unwrap();
        store.delete_pairing_ids(&[(10, 4)]).unwrap();
        store.insert_pairing_ids(&[(10, 5)]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(sorted(store.tag_taggables(10).unwrap()), vec![1, 2, 3, 5, 6]);
    assert!(!store.contains_pairing(10, 4).unwrap());
}

// ---------------------------------------------------------------------------
// Tests: Transactions
// ---------------------------------------------------------------------------

#[test]
fn crash_inside_transaction_rolls_back_to_flush() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1)]).unwrap();
        store.flush_files().unwrap();

        store.begin_transaction().unwrap();
        store.insert_pairing_ids(&[(10, 2)]).unwrap();
        store.delete_taggable_ids(&[1]).unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.taggable_count(), 2);
    assert_eq!(store.tag_taggables(10).unwrap(), vec![1]);
}

#[test]
fn ended_transaction_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.flush_files().unwrap();

        store.begin_transaction().unwrap();
        store.insert_pairing_ids(&[(10, 1), (10, 2)]).unwrap();
        store.delete_pairing_ids(&[(10, 1)]).unwrap();
        store.end_transaction().unwrap();
        crash(store);
    }

    let mut store = open(dir.path());
    assert_eq!(store.tag_taggables(10).unwrap(), vec![2]);
}

// ---------------------------------------------------------------------------
// Tests: Fatal Corruption
// ---------------------------------------------------------------------------

/// Rewrite one whitespace token of the manifest.
fn patch_manifest(dir: &Path, line: usize, column: usize, value: &str) {
    let path = dir.join(MANIFEST_FILE_NAME);
    let text = std::fs::read_to_string(&path).unwrap();
    let patched: Vec<String> = text
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i != line {
                return l.to_string();
            }
            let mut tokens: Vec<&str> = l.split_whitespace().collect();
            tokens[column] = value;
            tokens.join(" ")
        })
        .collect();
    std::fs::write(&path, patched.join("\n") + "\n").unwrap();
}

#[test]
fn unexplained_pairing_size_is_fatal() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2]).unwrap();
        store.insert_tag_ids(&[10]).unwrap();
        store.insert_pairing_ids(&[(10, 1)]).unwrap();
        store.flush_files().unwrap();
        // Without a diff, replay cannot change the size.
        store.purge_unused_files().unwrap();
        store.close().unwrap();
    }
    // Shard lines start at line 2; tag 10 routes to shard 2.
    patch_manifest(dir.path(), 2 + 2, 0, "99");

    let mut store = open(dir.path());
    let err = store.tag_taggables(10).unwrap_err();
    assert!(matches!(err, StoreError::ShardCorrupted { expected: 99, actual: 1, .. }));
    assert!(err.is_fatal());
    crash(store);
}

#[test]
fn unexplained_universe_size_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(dir.path());
        store.insert_taggable_ids(&[1, 2, 3]).unwrap();
        store.flush_files().unwrap();
        store.purge_unused_files().unwrap();
        store.close().unwrap();
    }
    patch_manifest(dir.path(), 1, 0, "5");

    let err = TagStore::open_with_config(dir.path(), StoreConfig::default().with_shard_count(SHARDS))
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::ShardCorrupted { expected: 5, actual: 3, .. }));
}

#[test]
fn stale_unfinished_file_is_replaced() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path());
    let unfinished = dir.path().join(format!("{MANIFEST_FILE_NAME}.unf"));
    std::fs::write(&unfinished, b"half written").unwrap();

    store.insert_taggable_ids(&[1]).unwrap();
    assert!(!unfinished.exists());
    store.close().unwrap();

    let store = open(dir.path());
    assert_eq!(store.taggable_count(), 1);
}
