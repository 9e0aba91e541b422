//! Per-sample metadata processing that runs in step with the transform graph

mod graph;
mod nodes;
mod reader;

pub use graph::{MetaNode, MetadataGraph};
pub use nodes::{ClipMetaNode, FlipMetaNode};
pub use reader::{JsonMetaDataReader, MetaDataReader};
