//! Error types shared across the LOKI workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, LokiError>;

#[derive(Error, Debug)]
pub enum LokiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid build identifier: {0}")]
    InvalidBuild(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
