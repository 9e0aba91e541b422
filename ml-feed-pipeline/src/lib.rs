//! Double-buffered batch pipeline for ml-feed
//!
//! The [`Pipeline`] owns a dedicated orchestrator thread that pulls batches
//! from a sharded loader, runs them through the transform and metadata
//! graphs and publishes them into a [`RingBuffer`]. The consumer advances
//! with [`Pipeline::run`] and reads the current batch in place.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ml_feed_core::{DataType, HostMemory, Layout, TensorInfo};
//! use ml_feed_parallel::{LoaderConfig, ShardedLoader};
//! use ml_feed_pipeline::{Pipeline, PipelineConfig, RunStatus};
//! use ml_feed_readers::{DecoderSpec, ReaderSpec};
//! use ml_feed_transforms::CopyNode;
//!
//! # fn main() -> ml_feed_pipeline::Result<()> {
//! let loader_config = LoaderConfig { batch_size: 32, shard_count: 4, ..LoaderConfig::default() };
//! let target = loader_config.target;
//! let reader = ReaderSpec::Directory { path: "/data/train".into(), memory_map: false };
//! let loader = ShardedLoader::from_spec(
//!     loader_config,
//!     &reader,
//!     DecoderSpec::Pnm,
//!     Arc::new(HostMemory::new()),
//! )?;
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::with_batch_size(32))?;
//! let input = pipeline.set_loader(loader)?;
//! let info = TensorInfo::new(
//!     vec![32, target.sample_size()],
//!     DataType::UInt8,
//!     Layout::Flat,
//! )?;
//! let output = pipeline.create_output_tensor(info)?;
//! pipeline.add_node(CopyNode, &[input], &[output])?;
//! pipeline.build()?;
//!
//! while pipeline.run()? == RunStatus::Ok {
//!     let batch = pipeline.output_tensors()?;
//!     println!("{} samples", batch.sample_count());
//! }
//! pipeline.release()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
mod orchestrator;
pub mod pipeline;
pub mod ring;
pub mod stats;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{MetaDataSizes, OutputBatch, Pipeline, RunStatus};
pub use ring::{RingBuffer, Slot};
pub use stats::PipelineStats;
