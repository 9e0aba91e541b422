//! Pipeline execution statistics

use std::time::Duration;

use ml_feed_core::MemoryStats;
use ml_feed_parallel::LoaderTiming;

/// Snapshot of what the pipeline has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Batches processed by the orchestrator
    pub batches_processed: u64,

    /// Real samples processed by the orchestrator
    pub samples_processed: u64,

    /// Batches handed to the consumer by `run`
    pub batches_delivered: u64,

    /// Time spent loading batches from the shards
    pub load_time: Duration,

    /// Time spent renewing parameters and executing the graph and
    /// metadata stages
    pub process_time: Duration,

    /// Time the orchestrator waited on a full ring
    pub writer_wait: Duration,

    /// Time the consumer waited on an empty ring
    pub reader_wait: Duration,

    /// Loader timing across shards
    pub loader: LoaderTiming,

    /// Allocator counters of the execution backend
    pub memory: MemoryStats,
}

impl PipelineStats {
    /// Average samples per processed batch
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_batch_fill(&self) -> f64 {
        if self.batches_processed == 0 {
            0.0
        } else {
            self.samples_processed as f64 / self.batches_processed as f64
        }
    }
}
