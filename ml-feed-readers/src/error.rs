//! Error types for readers and decoders

use thiserror::Error;

/// Error type for readers and decoders
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] ml_feed_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON format error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid reader or decoder configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sample could not be decoded
    #[error("Decode error for {name}: {reason}")]
    Decode {
        /// Name of the offending sample
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Reader was used before `initialize`
    #[error("Reader {0} is not initialized")]
    NotInitialized(String),

    /// No more items in this shard
    #[error("End of data")]
    EndOfData,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for readers and decoders
pub type Result<T> = std::result::Result<T, Error>;
