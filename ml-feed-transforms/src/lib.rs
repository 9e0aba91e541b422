//! Transform graph, randomized parameters and metadata graph for ml-feed
//!
//! A [`TransformGraph`] connects the loader's output tensors to the tensors
//! handed to the consumer through a DAG of [`TransformNode`]s. Tensor
//! ownership is fixed when nodes are added: every tensor has exactly one
//! producer. The [`MetadataGraph`] applies the matching per-sample
//! annotation updates for each batch.

#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod graph;
pub mod meta;
pub mod node;
pub mod nodes;
pub mod params;
pub mod registry;

pub use backend::{ExecutionBackend, HostBackend};
pub use error::{Error, Result};
pub use graph::{NodeId, TransformGraph};
pub use meta::{ClipMetaNode, FlipMetaNode, JsonMetaDataReader, MetaDataReader, MetaNode, MetadataGraph};
pub use node::{BuildContext, NodeKind, ParamContext, TransformNode};
pub use nodes::{BrightnessNode, CopyNode, FlipNode, FnNode};
pub use params::{FloatParam, IntParam, ParameterFactory};
pub use registry::NodeRegistry;
