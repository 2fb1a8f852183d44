//! Virtual repo repository.

use crate::error::MetadataResult;
use crate::models::VirtualRepoRow;
use async_trait::async_trait;

/// Repository for virtual-repo anchors.
#[async_trait]
pub trait VirtualRepoRepo: Send + Sync {
    /// Get the virtual info of a repo, if it is virtual.
    async fn get_virtual_info(&self, repo_id: &str) -> MetadataResult<Option<VirtualRepoRow>>;

    /// List all virtual repos mounted on an origin.
    async fn get_virtual_info_by_origin(
        &self,
        origin_repo: &str,
    ) -> MetadataResult<Vec<VirtualRepoRow>>;

    /// Create a virtual-repo anchor.
    async fn create_virtual_repo(&self, row: &VirtualRepoRow) -> MetadataResult<()>;

    /// Move a virtual repo's anchor: new base commit and (possibly
    /// renamed) mount path.
    async fn set_virtual_repo_base_commit_path(
        &self,
        repo_id: &str,
        base_commit: &str,
        path: &str,
    ) -> MetadataResult<()>;

    /// Tombstone a virtual repo whose origin path is irrecoverably gone.
    async fn del_virtual_repo(&self, repo_id: &str) -> MetadataResult<()>;
}
