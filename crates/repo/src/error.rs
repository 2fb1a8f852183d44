//! Error types for the repo machinery.

use thiserror::Error;

/// Errors from tree mutation, commit generation and syncing.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("failed to generate unique name for {0}")]
    UniqueName(String),

    /// Branch CAS exhausted its retries.
    #[error("stop updating repo {0} after 3 retries")]
    Contention(String),

    #[error(transparent)]
    Core(#[from] reef_core::Error),

    #[error(transparent)]
    Storage(#[from] reef_storage::StorageError),

    #[error(transparent)]
    Metadata(#[from] reef_metadata::MetadataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for repo operations.
pub type RepoResult<T> = std::result::Result<T, RepoError>;
