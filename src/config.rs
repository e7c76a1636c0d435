//! Store configuration.
//!
//! Constructed once when a store is opened and owned by the `TagStore`
//! for its whole lifetime. Optionally persisted as `store_config.json`
//! in the store directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// File name of the optional configuration inside a store directory.
pub const CONFIG_FILE_NAME: &str = "store_config.json";

/// Default number of pairing shards per direction.
pub const DEFAULT_SHARD_COUNT: u16 = 16;

/// Default physical/universe ratio above which a membership set flips
/// to complement representation.
pub const DEFAULT_COMPLEMENT_THRESHOLD: f64 = 0.6;

/// Default rename attempts for durable writes.
pub const DEFAULT_RENAME_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Pairing shards per direction (`id % shard_count` routing).
    /// Ignored when an existing manifest records a shard count.
    pub shard_count: u16,

    /// Complement flip threshold, as a fraction of the universe size.
    pub complement_threshold: f64,

    /// Rename attempts before a durable write is reported as failed.
    pub rename_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            complement_threshold: DEFAULT_COMPLEMENT_THRESHOLD,
            rename_retries: DEFAULT_RENAME_RETRIES,
        }
    }
}

impl StoreConfig {
    /// Read config from a store directory. Returns None if the file doesn't exist.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to a store directory.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(StoreError::InvalidFormat(
                "shard_count must be > 0".to_string(),
            ));
        }
        if !(self.complement_threshold > 0.0 && self.complement_threshold < 1.0) {
            return Err(StoreError::InvalidFormat(format!(
                "complement_threshold must be in (0, 1), got {}",
                self.complement_threshold
            )));
        }
        if self.rename_retries == 0 {
            return Err(StoreError::InvalidFormat(
                "rename_retries must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_shard_count(mut self, shard_count: u16) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_complement_threshold(mut self, threshold: f64) -> Self {
        self.complement_threshold = threshold;
        self
    }
}
