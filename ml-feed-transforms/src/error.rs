//! Error types for graph construction and execution

use ml_feed_core::TensorId;
use thiserror::Error;

/// Error type for graph construction and execution
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] ml_feed_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A node input was never produced by the loader or an earlier node
    #[error("Dangling input {tensor} of {node} node: tensor was never produced by a prior node or loader")]
    DanglingInput {
        /// Kind of the node being added
        node: String,
        /// The unproduced tensor
        tensor: TensorId,
    },

    /// A node output already has a producer
    #[error("{tensor} is already produced by another node")]
    AlreadyProduced {
        /// The doubly produced tensor
        tensor: TensorId,
    },

    /// Tensor id not known to this graph
    #[error("Unknown {0}")]
    UnknownTensor(TensorId),

    /// Node id not known to this graph
    #[error("Unknown node #{0}")]
    UnknownNode(usize),

    /// No factory registered for a node kind
    #[error("No node registered for kind '{0}'")]
    UnknownKind(String),

    /// The graph was modified after `build`
    #[error("Graph is already built")]
    AlreadyBuilt,

    /// The graph was executed before `build`
    #[error("Graph is not built")]
    NotBuilt,

    /// The graph contains a cycle
    #[error("Graph contains a cycle")]
    Cycle,

    /// An output tensor has no producer
    #[error("Output {0} is never produced")]
    Unresolved(TensorId),

    /// A node failed while executing
    #[error("{node} node failed: {reason}")]
    Execution {
        /// Kind of the failing node
        node: String,
        /// What went wrong
        reason: String,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for graph construction and execution
pub type Result<T> = std::result::Result<T, Error>;
