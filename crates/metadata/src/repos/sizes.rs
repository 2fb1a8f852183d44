//! Repo size and file-count repository.

use crate::error::MetadataResult;
use crate::models::{RepoFileCountRow, RepoSizeRow};
use async_trait::async_trait;

/// Repository for cached repo size statistics.
#[async_trait]
pub trait SizeRepo: Send + Sync {
    /// Get the cached size row.
    async fn get_repo_size(&self, repo_id: &str) -> MetadataResult<Option<RepoSizeRow>>;

    /// Get the cached file count row.
    async fn get_repo_file_count(&self, repo_id: &str)
        -> MetadataResult<Option<RepoFileCountRow>>;

    /// Persist size, head marker and file count in a single transaction.
    async fn set_size_and_file_count(
        &self,
        repo_id: &str,
        head_id: &str,
        size: i64,
        file_count: i64,
    ) -> MetadataResult<()>;
}
