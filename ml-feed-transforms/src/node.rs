//! The transform node interface

use std::fmt;

use ml_feed_core::{Tensor, TensorInfo};
use rand::rngs::StdRng;

use crate::error::Result;

/// Identifies a concrete node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKind(&'static str);

impl NodeKind {
    /// The loader's output node
    pub const LOADER: NodeKind = NodeKind("loader");

    /// Byte copy
    pub const COPY: NodeKind = NodeKind("copy");

    /// Per-sample brightness scaling
    pub const BRIGHTNESS: NodeKind = NodeKind("brightness");

    /// Per-sample horizontal flip
    pub const FLIP: NodeKind = NodeKind("flip");

    /// A node kind defined outside this crate
    pub const fn custom(name: &'static str) -> Self {
        NodeKind(name)
    }

    /// Kind name
    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Settings available to nodes when the graph is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildContext {
    /// Samples per batch
    pub batch_size: usize,

    /// Worker threads a node may use
    pub cpu_threads: usize,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            batch_size: 1,
            cpu_threads: 1,
        }
    }
}

/// Source of randomness for one batch's parameter renewal
pub struct ParamContext<'a> {
    /// Seeded generator owned by the orchestrator
    pub rng: &'a mut StdRng,

    /// Samples per batch
    pub batch_size: usize,
}

/// A vertex of the transform graph
pub trait TransformNode: Send {
    /// Kind of this node
    fn kind(&self) -> NodeKind;

    /// Validate tensor shapes and prepare for execution; called once by `build`
    fn create(
        &mut self,
        _ctx: &BuildContext,
        _inputs: &[&TensorInfo],
        _outputs: &[&TensorInfo],
    ) -> Result<()> {
        Ok(())
    }

    /// Draw this batch's randomized parameters
    fn update_parameters(&mut self, _ctx: &mut ParamContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Current per-sample parameters, for metadata stages that mirror this node
    fn parameters(&self) -> &[f32] {
        &[]
    }

    /// Apply the transform
    fn execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()>;
}
