//! Database models mapping to the metadata schema.

use sqlx::FromRow;

/// Repo registry record.
///
/// `name`/`desc` mirror the head commit's values so listing does not
/// require loading commits; they are refreshed on every branch advance.
#[derive(Debug, Clone, FromRow)]
pub struct RepoRow {
    pub repo_id: String,
    pub name: String,
    #[sqlx(rename = "description")]
    pub desc: String,
    pub version: i64,
    /// 0 = normal; anything else blocks uploads.
    pub status: i64,
    pub is_encrypted: bool,
    pub enc_version: i64,
    pub magic: Option<String>,
    pub random_key: Option<String>,
    pub salt: Option<String>,
}

/// Branch pointer record. "master" is the only branch the data plane uses.
#[derive(Debug, Clone, FromRow)]
pub struct BranchRow {
    pub repo_id: String,
    pub name: String,
    pub commit_id: String,
}

/// Denormalized repo info refreshed after each commit.
#[derive(Debug, Clone, FromRow)]
pub struct RepoInfoRow {
    pub repo_id: String,
    pub name: String,
    pub update_time: i64,
    pub version: i64,
    pub is_encrypted: bool,
    pub last_modifier: String,
}

/// Cached repo size, tagged with the head it was computed against.
#[derive(Debug, Clone, FromRow)]
pub struct RepoSizeRow {
    pub repo_id: String,
    pub size: i64,
    pub head_id: String,
}

/// Cached file count.
#[derive(Debug, Clone, FromRow)]
pub struct RepoFileCountRow {
    pub repo_id: String,
    pub file_count: i64,
}

/// A virtual library's anchor in its origin.
#[derive(Debug, Clone, FromRow)]
pub struct VirtualRepoRow {
    pub repo_id: String,
    pub origin_repo: String,
    pub path: String,
    pub base_commit: String,
}
