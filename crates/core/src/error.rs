//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid crypt key: {0}")]
    InvalidCryptKey(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
