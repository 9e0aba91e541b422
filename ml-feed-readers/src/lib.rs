//! Sharded sample readers and decoders for the ml-feed pipeline
//!
//! Readers enumerate the items of one shard, apply the last-batch policy and
//! hand out the raw bytes of each item. Decoders turn those bytes into the
//! fixed-size sample slots of a batch buffer.

#![warn(missing_docs)]

mod error;

pub mod config;
pub mod decoder;
pub mod factory;
pub mod file;
pub mod format;
pub mod memory;
pub mod reader;
pub mod shard;

pub use config::{LastBatchPolicy, ReaderConfig};
pub use decoder::{DecodeTarget, DecodedInfo, Decoder, PnmDecoder, RawDecoder};
pub use error::{Error, Result};
pub use factory::{create_decoder, create_reader, DecoderSpec, ReaderSpec};
pub use file::{FileReader, FileSource};
pub use format::SampleFormat;
pub use memory::{InMemoryReader, NamedSample};
pub use reader::Reader;
pub use shard::{ShardCursor, ShardPlan};
