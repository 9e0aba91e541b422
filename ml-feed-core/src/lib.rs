//! Core tensors, buffers, and metadata for the ml-feed batch pipeline
//!
//! This crate provides the foundational data model shared by the readers,
//! the per-shard loaders, the transform graph and the orchestrator: typed
//! and shaped tensors whose storage is an exchangeable [`BufferHandle`],
//! the host memory backend those buffers come from, and the per-sample
//! annotation model that travels alongside each batch.

#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod io;
pub mod memory;
pub mod metadata;
pub mod tensor;

// Re-export key types for convenience
pub use buffer::BufferHandle;
pub use error::{Error, Result};
pub use memory::{HostMemory, MemoryBackend, MemoryStats};
pub use metadata::{BoundingBox, MaskPolygon, MetaDataBatch, MetaDataKind, SampleMeta};
pub use tensor::{DataType, Layout, MemorySpace, Roi, Tensor, TensorId, TensorInfo, TensorRole};
