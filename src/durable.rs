//! All-or-nothing file replacement.
//!
//! `write_durably` writes to a sibling `.unf` path, syncs it, then renames
//! it over the destination. The rename is retried on failure; readers see
//! either the old file or the complete new one.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Suffix of the in-progress temp file.
pub const UNFINISHED_SUFFIX: &str = ".unf";

const RENAME_BACKOFF: Duration = Duration::from_millis(10);

fn unfinished_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(UNFINISHED_SUFFIX);
    PathBuf::from(name)
}

/// Replace `path` with `data`, retrying the rename up to `attempts` times.
pub fn write_durably(path: &Path, data: &[u8], attempts: u32) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let temp_path = unfinished_path(path);
    if temp_path.exists() {
        tracing::warn!("removing stale unfinished file {}", temp_path.display());
        fs::remove_file(&temp_path)?;
    }

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match fs::rename(&temp_path, path) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(e) => {
                tracing::warn!(
                    "rename {} -> {} failed (attempt {}/{}): {}",
                    temp_path.display(),
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(RENAME_BACKOFF);
                }
            }
        }
    }
    if let Some(source) = last_err {
        return Err(StoreError::DurableWrite {
            path: path.to_path_buf(),
            attempts,
            source,
        });
    }

    // Sync parent directory so the rename itself survives a crash
    if let Some(parent) = parent {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read a whole file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file if present. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
