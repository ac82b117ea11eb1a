//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use groundsync_common::{Error, Result};

use crate::retry::RetryConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a remote load during a merge prelude.
    pub merge_timeout: Duration,
    /// Backoff policy for delivery and tile jobs.
    pub retry: RetryConfig,
    /// Deliveries running at once, across all entities.
    pub max_concurrent_deliveries: usize,
    /// Directory holding downloaded tile files.
    pub tile_dir: PathBuf,
    /// Bytes written to a tile file per write.
    pub tile_chunk_size: usize,
    /// Keep fields with undelivered local edits when merging remote state.
    pub preserve_pending_edits: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            max_concurrent_deliveries: 4,
            tile_dir: PathBuf::from("tiles"),
            tile_chunk_size: 4096,
            preserve_pending_edits: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file. Missing keys take defaults.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not valid JSON
    /// - `Validation` if a value is out of range
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.merge_timeout.is_zero() {
            return Err(Error::Validation("merge_timeout must be positive".to_string()));
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(Error::Validation(
                "max_concurrent_deliveries must be positive".to_string(),
            ));
        }
        if self.tile_chunk_size == 0 {
            return Err(Error::Validation("tile_chunk_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.merge_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.preserve_pending_edits);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"tile_chunk_size": 1024, "preserve_pending_edits": false}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.tile_chunk_size, 1024);
        assert!(!config.preserve_pending_edits);
        assert_eq!(config.max_concurrent_deliveries, 4);
    }

    #[test]
    fn test_load_rejects_zero_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"tile_chunk_size": 0}"#).unwrap();

        assert!(matches!(SyncConfig::load(&path), Err(Error::Validation(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SyncConfig::load(dir.path().join("absent.json")),
            Err(Error::Io(_))
        ));
    }
}
