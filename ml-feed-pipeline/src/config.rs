//! Pipeline configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ml_feed_core::MemorySpace;

use crate::error::{PipelineError, Result};

/// Configuration for a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Samples per batch
    pub batch_size: usize,

    /// Ring buffer slots; batches processed ahead of the consumer plus the
    /// one it is reading
    pub prefetch_depth: usize,

    /// Threads available to transform nodes; 0 derives a count from the
    /// machine and the shard count
    pub cpu_threads: usize,

    /// Seed for randomized transform parameters
    pub seed: u64,

    /// Never run out of data
    pub loop_forever: bool,

    /// Memory space of the output tensors
    pub output_memory_space: MemorySpace,

    /// How long the orchestrator sleeps between checks once the loader has
    /// no full batch left
    pub idle_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            prefetch_depth: 2,
            cpu_threads: 0,
            seed: 0,
            loop_forever: false,
            output_memory_space: MemorySpace::Host,
            idle_poll_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Configuration with the given batch size and defaults elsewhere
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config(
                "batch size must be greater than zero".into(),
            ));
        }
        if self.prefetch_depth < 2 {
            return Err(PipelineError::Config(format!(
                "prefetch depth must be at least 2, got {}",
                self.prefetch_depth
            )));
        }
        Ok(())
    }

    /// Idle poll interval as a duration
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Threads per node for `shard_count` shards. An explicit `cpu_threads`
    /// wins; otherwise half the logical cores (at least two) are split
    /// across the shards.
    pub fn resolved_cpu_threads(&self, shard_count: usize) -> usize {
        const MIN_CPUS: usize = 2;
        const SMT_COUNT: usize = 2;
        if self.cpu_threads > 0 {
            return self.cpu_threads;
        }
        let cpus = num_cpus::get().max(MIN_CPUS);
        (cpus / SMT_COUNT / shard_count.max(1)).max(1)
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
