//! Shard partitioning, last-batch padding and read cursors

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{LastBatchPolicy, ReaderConfig};
use crate::error::Result;

/// The items of one shard after the last-batch policy has been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    /// Indices into the full item list, in read order
    items: Vec<usize>,

    /// Number of real items owned by the shard
    real_count: usize,

    /// Reported padded size of the final batch
    padded_size: usize,
}

impl ShardPlan {
    /// Interleaved sharding: item `i` belongs to shard `i % shard_count`
    pub fn interleaved(total_items: usize, config: &ReaderConfig) -> Result<Self> {
        config.validate()?;
        let owned = (config.shard_id..total_items)
            .step_by(config.shard_count)
            .collect();
        Ok(Self::with_policy(owned, config))
    }

    /// Every item belongs to this shard
    pub fn whole(total_items: usize, config: &ReaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_policy((0..total_items).collect(), config))
    }

    fn with_policy(mut items: Vec<usize>, config: &ReaderConfig) -> Self {
        let real_count = items.len();
        let batch = config.batch_size;
        let remainder = real_count % batch;
        let mut padded_size = 0;

        if remainder != 0 && real_count != 0 {
            match config.last_batch_policy {
                LastBatchPolicy::Fill => {
                    let pad = batch - remainder;
                    let last = items[real_count - 1];
                    for k in 0..pad {
                        let item = if config.pad_with_last {
                            last
                        } else {
                            items[k % real_count]
                        };
                        items.push(item);
                    }
                    padded_size = pad;
                }
                LastBatchPolicy::Drop => items.truncate(real_count - remainder),
                LastBatchPolicy::Partial => padded_size = batch - remainder,
            }
        }

        Self {
            items,
            real_count,
            padded_size,
        }
    }

    /// Item indices in read order, padding included
    pub fn items(&self) -> &[usize] {
        &self.items
    }

    /// Number of items that will be read, padding included
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the shard reads nothing
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of real items the shard owns
    pub fn real_count(&self) -> usize {
        self.real_count
    }

    /// For FILL and PARTIAL, how many samples the final batch is short of a
    /// full batch; zero for DROP or when the shard divides evenly
    pub fn padded_size(&self) -> usize {
        self.padded_size
    }
}

/// Read position over a [`ShardPlan`], with optional shuffling and looping
#[derive(Debug, Clone)]
pub struct ShardCursor {
    /// The plan being read
    plan: ShardPlan,

    /// Current read order (a permutation of the plan when shuffling)
    order: Vec<usize>,

    /// Number of items handed out since the last reset
    read_count: usize,

    /// Wrap around instead of running out
    loop_forever: bool,

    /// Reshuffle on reset
    shuffle: bool,

    /// Source of shuffles
    rng: StdRng,
}

impl ShardCursor {
    /// Create a cursor over `plan`
    pub fn new(plan: ShardPlan, config: &ReaderConfig) -> Self {
        let mut cursor = Self {
            order: plan.items().to_vec(),
            plan,
            read_count: 0,
            loop_forever: config.loop_forever,
            shuffle: config.shuffle,
            rng: StdRng::seed_from_u64(config.seed ^ config.shard_id as u64),
        };
        if cursor.shuffle {
            cursor.order.shuffle(&mut cursor.rng);
        }
        cursor
    }

    /// Items left to read; never drops in loop mode
    pub fn remaining(&self) -> usize {
        if self.loop_forever {
            return self.order.len();
        }
        self.order.len().saturating_sub(self.read_count)
    }

    /// Hand out the next item index
    pub fn advance(&mut self) -> Option<usize> {
        if self.order.is_empty() || (!self.loop_forever && self.read_count >= self.order.len()) {
            return None;
        }
        let item = self.order[self.read_count % self.order.len()];
        self.read_count += 1;
        Some(item)
    }

    /// Rewind to the start, reshuffling when enabled
    pub fn reset(&mut self) {
        self.read_count = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// The underlying plan
    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }
}
