//! Reader configuration and last-batch policies

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a shard's final, undersized batch is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastBatchPolicy {
    /// Repeat samples so the final batch is full
    #[default]
    Fill,

    /// Discard the remainder
    Drop,

    /// Emit a short final batch
    Partial,
}

/// Configuration shared by every reader of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Index of the shard this reader serves
    pub shard_id: usize,

    /// Total number of shards
    pub shard_count: usize,

    /// Samples per batch
    pub batch_size: usize,

    /// Last-batch policy
    pub last_batch_policy: LastBatchPolicy,

    /// Under [`LastBatchPolicy::Fill`], pad with the last item instead of
    /// wrapping around to the start of the shard
    pub pad_with_last: bool,

    /// Shuffle item order on initialise and on every reset
    pub shuffle: bool,

    /// Never run out of items; wrap around at the end of the shard
    pub loop_forever: bool,

    /// Seed for shuffling
    pub seed: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            shard_count: 1,
            batch_size: 1,
            last_batch_policy: LastBatchPolicy::Fill,
            pad_with_last: false,
            shuffle: false,
            loop_forever: false,
            seed: 0,
        }
    }
}

impl ReaderConfig {
    /// Configuration for shard `shard_id` of `shard_count`
    pub fn for_shard(shard_id: usize, shard_count: usize, batch_size: usize) -> Self {
        Self {
            shard_id,
            shard_count,
            batch_size,
            ..Self::default()
        }
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than zero".into()));
        }
        if self.shard_count == 0 {
            return Err(Error::Config("shard count must be at least one".into()));
        }
        if self.shard_id >= self.shard_count {
            return Err(Error::Config(format!(
                "shard id {} is out of range for {} shards",
                self.shard_id, self.shard_count
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 1, 0 ; "zero batch")]
    #[test_case(0, 0, 4 ; "zero shards")]
    #[test_case(2, 2, 4 ; "shard id out of range")]
    fn test_invalid_configs(shard_id: usize, shard_count: usize, batch_size: usize) {
        let config = ReaderConfig::for_shard(shard_id, shard_count, batch_size);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_json() {
        let config = ReaderConfig::from_json_str(
            r#"{"shard_id": 1, "shard_count": 2, "batch_size": 4, "last_batch_policy": "partial"}"#,
        )
        .unwrap();
        assert_eq!(config.last_batch_policy, LastBatchPolicy::Partial);
        assert_eq!(config.shard_id, 1);
        assert!(!config.shuffle);

        assert!(ReaderConfig::from_json_str(r#"{"shard_id": 3, "shard_count": 2}"#).is_err());
    }
}
