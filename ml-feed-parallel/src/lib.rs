//! Per-shard prefetching and round-robin sharded loading
//!
//! Every shard owns a reader, a decoder and a prefetch thread that fills
//! batch buffers ahead of time. [`ShardedLoader`] presents the shards as one
//! logical loader that hands out batches in round-robin order, skipping
//! shards that have run dry.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod shard;
pub mod sharded;

pub use config::LoaderConfig;
pub use error::{Error, Result};
pub use shard::{BatchInfo, LoadStatus, LoadedBatch, ShardLoader, ShardTiming};
pub use sharded::{LoaderTiming, ShardedLoader};
