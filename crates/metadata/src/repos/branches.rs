//! Branch repository.

use crate::error::MetadataResult;
use crate::models::BranchRow;
use async_trait::async_trait;

/// Repository for branch pointer operations.
#[async_trait]
pub trait BranchRepo: Send + Sync {
    /// Get a branch by repo and name.
    async fn get_branch(&self, repo_id: &str, name: &str) -> MetadataResult<Option<BranchRow>>;

    /// Create or overwrite a branch pointer unconditionally.
    ///
    /// Used when a repo is created; ordinary advancement goes through
    /// [`BranchRepo::update_branch_cas`].
    async fn set_branch(&self, branch: &BranchRow) -> MetadataResult<()>;

    /// Advance a branch from `old_commit_id` to `new_commit_id`.
    ///
    /// The update is a compare-and-swap: inside one transaction the
    /// current pointer is read and, only if it still equals
    /// `old_commit_id`, rewritten. A concurrent advancement surfaces as
    /// [`crate::MetadataError::StaleHead`].
    async fn update_branch_cas(
        &self,
        repo_id: &str,
        name: &str,
        new_commit_id: &str,
        old_commit_id: &str,
    ) -> MetadataResult<()>;
}
