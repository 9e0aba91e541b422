//! Loader configuration

use serde::{Deserialize, Serialize};

use ml_feed_core::MemorySpace;
use ml_feed_readers::{DecodeTarget, LastBatchPolicy, ReaderConfig};

use crate::error::{Error, Result};

/// Configuration of a sharded loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Samples per batch
    pub batch_size: usize,

    /// Number of shards
    pub shard_count: usize,

    /// Last-batch policy applied by every shard
    pub last_batch_policy: LastBatchPolicy,

    /// Under FILL, pad with the last item instead of wrapping to the start
    pub pad_with_last: bool,

    /// Shuffle items within each shard
    pub shuffle: bool,

    /// Never run out of data
    pub loop_forever: bool,

    /// Seed for shuffling
    pub seed: u64,

    /// Batches each shard prefetches ahead of the consumer
    pub prefetch_depth: usize,

    /// Geometry of one decoded sample
    pub target: DecodeTarget,

    /// Memory space of batch buffers
    pub memory_space: MemorySpace,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shard_count: 1,
            last_batch_policy: LastBatchPolicy::Fill,
            pad_with_last: false,
            shuffle: false,
            loop_forever: false,
            seed: 0,
            prefetch_depth: 2,
            target: DecodeTarget {
                width: 1,
                height: 1,
                channels: 1,
            },
            memory_space: MemorySpace::Host,
        }
    }
}

impl LoaderConfig {
    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than zero".into()));
        }
        if self.shard_count == 0 {
            return Err(Error::Config("shard count must be at least one".into()));
        }
        if self.prefetch_depth == 0 {
            return Err(Error::Config("prefetch depth must be at least one".into()));
        }
        if self.target.sample_size() == 0 {
            return Err(Error::Config("decoded sample size must be non-zero".into()));
        }
        Ok(())
    }

    /// Reader configuration for one shard
    pub fn reader_config(&self, shard_id: usize) -> ReaderConfig {
        ReaderConfig {
            shard_id,
            shard_count: self.shard_count,
            batch_size: self.batch_size,
            last_batch_policy: self.last_batch_policy,
            pad_with_last: self.pad_with_last,
            shuffle: self.shuffle,
            loop_forever: self.loop_forever,
            seed: self.seed,
        }
    }

    /// Bytes of one full batch buffer
    pub fn batch_bytes(&self) -> usize {
        self.batch_size * self.target.sample_size()
    }

    /// Smallest remaining count that still yields a batch
    pub fn min_batch(&self) -> usize {
        match self.last_batch_policy {
            LastBatchPolicy::Partial => 1,
            LastBatchPolicy::Fill | LastBatchPolicy::Drop => self.batch_size,
        }
    }
}
