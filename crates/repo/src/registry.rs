//! Repo registry: resolved repo handles and the upload temp-file map.

use crate::error::{RepoError, RepoResult};
use crate::store::{BlockStore, CommitStore, FsStore};
use reef_core::fs::{Commit, Directory};
use reef_core::ObjectId;
use reef_metadata::models::{BranchRow, RepoRow, VirtualRepoRow};
use reef_metadata::{BranchRepo, MetadataStore, RegistryRepo, VirtualRepoRepo};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Repo status value accepted for uploads.
pub const REPO_STATUS_NORMAL: i64 = 0;

/// A repo resolved against its current head.
#[derive(Debug, Clone)]
pub struct Repo {
    pub id: String,
    /// Object-store partition; equals the origin's id for virtual repos.
    pub store_id: String,
    pub name: String,
    pub desc: String,
    pub version: u32,
    pub status: i64,
    pub head_commit_id: ObjectId,
    pub root_id: ObjectId,
    pub is_encrypted: bool,
    pub enc_version: u32,
    pub magic: Option<String>,
    pub random_key: Option<String>,
    pub salt: Option<String>,
    pub virtual_info: Option<VirtualRepoRow>,
}

impl Repo {
    pub fn is_virtual(&self) -> bool {
        self.virtual_info.is_some()
    }
}

/// Access hub for everything below the HTTP layer: the typed stores, the
/// metadata database and the process-local resumable-upload map.
pub struct RepoManager {
    pub metadata: Arc<dyn MetadataStore>,
    pub fs: FsStore,
    pub blocks: BlockStore,
    pub commits: CommitStore,
    tmp_files: Mutex<HashMap<(String, String), PathBuf>>,
    /// Per-(repo, path) write locks; chunk writes into one assembly file
    /// must not interleave even if a client misbehaves.
    tmp_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl RepoManager {
    pub fn new(metadata: Arc<dyn MetadataStore>, objects: Arc<dyn reef_storage::ObjectStore>) -> Self {
        Self {
            metadata,
            fs: FsStore::new(objects.clone()),
            blocks: BlockStore::new(objects.clone()),
            commits: CommitStore::new(objects),
            tmp_files: Mutex::new(HashMap::new()),
            tmp_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a repo handle: registry row + master head + virtual info.
    pub async fn get(&self, repo_id: &str) -> RepoResult<Repo> {
        let row = self
            .metadata
            .get_repo(repo_id)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("repo {repo_id}")))?;

        let branch = self
            .metadata
            .get_branch(repo_id, "master")
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("branch master of {repo_id}")))?;
        let head_commit_id = ObjectId::from_hex(&branch.commit_id)?;

        let virtual_info = self.metadata.get_virtual_info(repo_id).await?;
        let store_id = virtual_info
            .as_ref()
            .map(|v| v.origin_repo.clone())
            .unwrap_or_else(|| repo_id.to_string());

        let head = self.commits.load(repo_id, &head_commit_id).await?;

        Ok(Repo {
            id: row.repo_id,
            store_id,
            name: row.name,
            desc: row.desc,
            version: row.version as u32,
            status: row.status,
            head_commit_id,
            root_id: head.root_id,
            is_encrypted: row.is_encrypted,
            enc_version: row.enc_version as u32,
            magic: row.magic,
            random_key: row.random_key,
            salt: row.salt,
            virtual_info,
        })
    }

    /// Create a repo with an empty root and an initial commit.
    pub async fn create_repo(&self, repo_id: &str, name: &str, user: &str) -> RepoResult<Repo> {
        let root_id = self.fs.save_dir(repo_id, &Directory::empty()).await?;
        let mut commit = Commit {
            commit_id: reef_core::ZERO_OBJ_ID,
            repo_id: repo_id.to_string(),
            root_id,
            parent_id: None,
            second_parent_id: None,
            creator_id: "0".repeat(40),
            creator_name: user.to_string(),
            desc: "Created library".to_string(),
            ctime: now(),
            repo_name: name.to_string(),
            repo_desc: String::new(),
            encrypted: false,
            enc_version: 0,
            magic: None,
            random_key: None,
            salt: None,
            version: 1,
            new_merge: false,
            conflict: false,
        };
        commit.commit_id = commit.compute_id();
        self.commits.save(&commit).await?;

        self.metadata
            .create_repo(&RepoRow {
                repo_id: repo_id.to_string(),
                name: name.to_string(),
                desc: String::new(),
                version: 1,
                status: REPO_STATUS_NORMAL,
                is_encrypted: false,
                enc_version: 0,
                magic: None,
                random_key: None,
                salt: None,
            })
            .await?;
        self.metadata
            .set_branch(&BranchRow {
                repo_id: repo_id.to_string(),
                name: "master".to_string(),
                commit_id: commit.commit_id.to_hex(),
            })
            .await?;

        self.get(repo_id).await
    }

    /// Create a virtual repo pinned to `path` of `origin`.
    ///
    /// The virtual head reuses the directory object at the mount point;
    /// both repos share the origin's store partition, so no objects are
    /// copied.
    pub async fn create_virtual_repo(
        &self,
        repo_id: &str,
        origin_repo: &str,
        path: &str,
        user: &str,
    ) -> RepoResult<Repo> {
        let origin = self.get(origin_repo).await?;
        let mount_root = self
            .fs
            .get_dir_id_by_path(&origin.store_id, &origin.root_id, path)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("path {path} in repo {origin_repo}")))?;

        let name = reef_core::path::base_name(path);
        let mut commit = Commit {
            commit_id: reef_core::ZERO_OBJ_ID,
            repo_id: repo_id.to_string(),
            root_id: mount_root,
            parent_id: None,
            second_parent_id: None,
            creator_id: "0".repeat(40),
            creator_name: user.to_string(),
            desc: "Created library".to_string(),
            ctime: now(),
            repo_name: name.clone(),
            repo_desc: String::new(),
            encrypted: false,
            enc_version: 0,
            magic: None,
            random_key: None,
            salt: None,
            version: 1,
            new_merge: false,
            conflict: false,
        };
        commit.commit_id = commit.compute_id();
        self.commits.save(&commit).await?;

        self.metadata
            .create_repo(&RepoRow {
                repo_id: repo_id.to_string(),
                name,
                desc: String::new(),
                version: 1,
                status: REPO_STATUS_NORMAL,
                is_encrypted: false,
                enc_version: 0,
                magic: None,
                random_key: None,
                salt: None,
            })
            .await?;
        self.metadata
            .set_branch(&BranchRow {
                repo_id: repo_id.to_string(),
                name: "master".to_string(),
                commit_id: commit.commit_id.to_hex(),
            })
            .await?;
        self.metadata
            .create_virtual_repo(&VirtualRepoRow {
                repo_id: repo_id.to_string(),
                origin_repo: origin_repo.to_string(),
                path: reef_core::path::canon_path(path),
                base_commit: origin.head_commit_id.to_hex(),
            })
            .await?;

        self.get(repo_id).await
    }

    /// Look up the resumable-upload temp file for `(repo, path)`.
    pub async fn get_upload_tmp_file(&self, repo_id: &str, path: &str) -> Option<PathBuf> {
        let map = self.tmp_files.lock().await;
        map.get(&(repo_id.to_string(), path.to_string())).cloned()
    }

    /// Record the resumable-upload temp file for `(repo, path)`.
    pub async fn add_upload_tmp_file(&self, repo_id: &str, path: &str, tmp: PathBuf) {
        let mut map = self.tmp_files.lock().await;
        map.insert((repo_id.to_string(), path.to_string()), tmp);
    }

    /// Evict the resumable-upload mapping for `(repo, path)`.
    pub async fn del_upload_tmp_file(&self, repo_id: &str, path: &str) {
        let key = (repo_id.to_string(), path.to_string());
        self.tmp_files.lock().await.remove(&key);
        self.tmp_locks.lock().await.remove(&key);
    }

    /// Get the write lock guarding the assembly file for `(repo, path)`.
    pub async fn upload_path_lock(&self, repo_id: &str, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tmp_locks.lock().await;
        locks
            .entry((repo_id.to_string(), path.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Current unix time in seconds.
pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
