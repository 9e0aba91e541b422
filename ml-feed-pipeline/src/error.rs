//! Error types for the pipeline orchestrator

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] ml_feed_core::Error),

    /// Reader or decoder error
    #[error("Reader error: {0}")]
    Reader(#[from] ml_feed_readers::Error),

    /// Sharded loader error
    #[error("Loader error: {0}")]
    Loader(#[from] ml_feed_parallel::Error),

    /// Graph construction or execution error
    #[error("Graph error: {0}")]
    Graph(#[from] ml_feed_transforms::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Call not allowed in the pipeline's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The orchestrator thread stopped on a fatal error
    #[error("Pipeline terminated: {0}")]
    Terminated(String),

    /// The orchestrator thread could not be spawned
    #[error("Failed to spawn orchestrator thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A lock guarding shared state was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PipelineError::Poisoned(err.to_string())
    }
}
