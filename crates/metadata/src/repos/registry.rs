//! Repo registry repository.

use crate::error::MetadataResult;
use crate::models::{RepoInfoRow, RepoRow};
use async_trait::async_trait;

/// Repository for the repo registry and denormalized repo info.
#[async_trait]
pub trait RegistryRepo: Send + Sync {
    /// Get a repo registry row.
    async fn get_repo(&self, repo_id: &str) -> MetadataResult<Option<RepoRow>>;

    /// Create a repo registry row.
    async fn create_repo(&self, repo: &RepoRow) -> MetadataResult<()>;

    /// Update a repo's display name and description.
    async fn update_repo_name_desc(
        &self,
        repo_id: &str,
        name: &str,
        desc: &str,
    ) -> MetadataResult<()>;

    /// Upsert the denormalized repo info row after a branch advance.
    async fn upsert_repo_info(&self, info: &RepoInfoRow) -> MetadataResult<()>;

    /// Get the denormalized repo info row.
    async fn get_repo_info(&self, repo_id: &str) -> MetadataResult<Option<RepoInfoRow>>;
}
