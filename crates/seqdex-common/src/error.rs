//! Error types shared across seqdex crates

use thiserror::Error;

/// Result type alias for seqdex operations
pub type Result<T> = std::result::Result<T, SeqdexError>;

/// Errors that cross crate boundaries
#[derive(Error, Debug)]
pub enum SeqdexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid side file {path}: {reason}")]
    InvalidSideFile { path: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl SeqdexError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
