//! Error types for the shard loaders

use thiserror::Error;

/// Error type for the shard loaders
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] ml_feed_core::Error),

    /// Reader or decoder error
    #[error("Reader error: {0}")]
    Reader(#[from] ml_feed_readers::Error),

    /// Invalid loader configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the loader's current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A prefetch thread could not be spawned
    #[error("Failed to spawn prefetch thread for shard {shard_id}: {source}")]
    Spawn {
        /// Shard whose thread failed to start
        shard_id: usize,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// A prefetch thread stopped while batches were still expected
    #[error("Prefetch thread for shard {0} stopped unexpectedly")]
    WorkerStopped(usize),

    /// A prefetch thread panicked
    #[error("Prefetch thread for shard {0} panicked")]
    WorkerPanicked(usize),
}

/// Result type for the shard loaders
pub type Result<T> = std::result::Result<T, Error>;
