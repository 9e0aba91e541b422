//! Round-robin loading across independently prefetching shards

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use ml_feed_core::{MemoryBackend, Tensor};
use ml_feed_readers::{create_decoder, create_reader, Decoder, DecoderSpec, Reader, ReaderSpec};

use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::shard::{BatchInfo, LoadStatus, ShardLoader, ShardTiming};

/// Timing summary across shards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderTiming {
    /// Largest per-shard read time; shards read concurrently
    pub read_time: Duration,

    /// Largest per-shard decode time
    pub decode_time: Duration,

    /// Total time spent swapping buffers into the output tensor
    pub swap_time: Duration,

    /// Total time the caller waited for prefetched batches
    pub wait_time: Duration,
}

/// Several shards presented as one loader.
///
/// Each call to [`ShardedLoader::load_next`] moves the cursor one shard
/// forward, skipping shards with nothing left, and loads from the shard it
/// lands on.
pub struct ShardedLoader {
    /// The shards, in round-robin order
    shards: Vec<ShardLoader>,

    /// Shard that served the previous batch
    cursor: usize,

    /// Shard that served the most recent batch, if any
    current: Option<usize>,

    /// Loader configuration
    config: LoaderConfig,
}

impl ShardedLoader {
    /// Build one shard per reader. `readers.len()` must equal the configured
    /// shard count; reader `i` serves shard `i`.
    pub fn initialize<F>(
        config: LoaderConfig,
        readers: Vec<Box<dyn Reader>>,
        make_decoder: F,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self>
    where
        F: Fn() -> Box<dyn Decoder>,
    {
        config.validate()?;
        if readers.len() != config.shard_count {
            return Err(Error::Config(format!(
                "{} readers supplied for {} shards",
                readers.len(),
                config.shard_count
            )));
        }

        let shards = readers
            .into_iter()
            .enumerate()
            .map(|(shard_id, reader)| {
                ShardLoader::new(shard_id, reader, make_decoder(), &config, Arc::clone(&memory))
            })
            .collect::<Result<Vec<_>>>()?;

        let loader = Self {
            cursor: config.shard_count - 1,
            current: None,
            shards,
            config,
        };
        info!(
            shards = loader.shards.len(),
            remaining = loader.remaining_count(),
            "sharded loader initialized"
        );
        Ok(loader)
    }

    /// Build one reader per shard from a reader description
    pub fn from_spec(
        config: LoaderConfig,
        reader: &ReaderSpec,
        decoder: DecoderSpec,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        let readers = (0..config.shard_count).map(|_| create_reader(reader)).collect();
        Self::initialize(config, readers, || create_decoder(decoder), memory)
    }

    /// Start every shard's prefetch thread
    pub fn start(&mut self) -> Result<()> {
        for shard in &mut self.shards {
            shard.start()?;
        }
        Ok(())
    }

    /// Stop every shard's prefetch thread
    pub fn stop(&mut self) -> Result<()> {
        for shard in &mut self.shards {
            shard.stop()?;
        }
        Ok(())
    }

    /// Load the next batch into `tensor` from the next shard that still has
    /// data. Returns [`LoadStatus::NoMoreData`] once every shard is empty.
    pub fn load_next(&mut self, tensor: &mut Tensor) -> Result<LoadStatus> {
        let count = self.shards.len();
        self.cursor = (self.cursor + 1) % count;
        let mut visited = 1;
        while self.shards[self.cursor].remaining_count() == 0 && visited < count {
            self.cursor = (self.cursor + 1) % count;
            visited += 1;
        }

        let shard = &mut self.shards[self.cursor];
        if shard.remaining_count() == 0 {
            return Ok(LoadStatus::NoMoreData);
        }
        let status = shard.load_next(tensor)?;
        if status == LoadStatus::Ok {
            self.current = Some(self.cursor);
            debug!(
                shard_id = self.cursor,
                samples = shard.last_batch().sample_count(),
                "batch loaded"
            );
        }
        Ok(status)
    }

    /// Sum of the shards' remaining counts
    pub fn remaining_count(&self) -> usize {
        self.shards.iter().map(ShardLoader::remaining_count).sum()
    }

    /// Whether at least one more batch can be produced
    pub fn has_batch(&self) -> bool {
        self.remaining_count() >= self.config.min_batch()
    }

    /// Stop and restart every shard, and rewind the cursor
    pub fn reset(&mut self) -> Result<()> {
        for shard in &mut self.shards {
            shard.reset()?;
        }
        self.cursor = self.shards.len() - 1;
        self.current = None;
        info!(remaining = self.remaining_count(), "sharded loader reset");
        Ok(())
    }

    /// Bookkeeping of the most recent batch
    pub fn last_batch(&self) -> Option<&BatchInfo> {
        self.current.map(|i| self.shards[i].last_batch())
    }

    /// Sum of the shards' final-batch padded sizes
    pub fn last_batch_padded_size(&self) -> usize {
        self.shards
            .iter()
            .map(ShardLoader::last_batch_padded_size)
            .sum()
    }

    /// Timing summary across shards
    pub fn timing(&self) -> LoaderTiming {
        self.shards
            .iter()
            .map(ShardLoader::timing)
            .fold(LoaderTiming::default(), |acc, t: ShardTiming| LoaderTiming {
                read_time: acc.read_time.max(t.read_time),
                decode_time: acc.decode_time.max(t.decode_time),
                swap_time: acc.swap_time + t.swap_time,
                wait_time: acc.wait_time + t.wait_time,
            })
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}
