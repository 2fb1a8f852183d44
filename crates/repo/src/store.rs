//! Typed object stores layered over the raw byte store.
//!
//! Blocks and fs objects are keyed by the owning repo's *store id* (a
//! virtual repo shares its origin's partition); commits are keyed by the
//! repo id itself. Keys shard on the first two hex chars of the object
//! id, matching the on-disk layout servers have always used.

use crate::error::{RepoError, RepoResult};
use bytes::Bytes;
use reef_core::fs::{Commit, DirEntry, Directory, FileObject};
use reef_core::path::canon_path;
use reef_core::ObjectId;
use reef_storage::{ByteStream, ObjectStore, StorageError};
use std::sync::Arc;

fn shard_key(prefix: &str, scope: &str, id: &ObjectId) -> String {
    let hex = id.to_hex();
    format!("{scope}/{prefix}/{}/{}", &hex[..2], &hex[2..])
}

/// Store for opaque block payloads.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<dyn ObjectStore>,
}

impl BlockStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub async fn exists(&self, store_id: &str, id: &ObjectId) -> RepoResult<bool> {
        Ok(self.inner.exists(&shard_key("blocks", store_id, id)).await?)
    }

    /// Size of a stored block.
    pub async fn stat(&self, store_id: &str, id: &ObjectId) -> RepoResult<u64> {
        Ok(self.inner.stat(&shard_key("blocks", store_id, id)).await?.size)
    }

    pub async fn read(&self, store_id: &str, id: &ObjectId) -> RepoResult<Bytes> {
        Ok(self.inner.get(&shard_key("blocks", store_id, id)).await?)
    }

    pub async fn read_stream(&self, store_id: &str, id: &ObjectId) -> RepoResult<ByteStream> {
        Ok(self.inner.get_stream(&shard_key("blocks", store_id, id)).await?)
    }

    /// Write a block under the SHA-1 of `data`, returning the id.
    pub async fn write(&self, store_id: &str, data: Bytes) -> RepoResult<ObjectId> {
        let id = ObjectId::compute(&data);
        self.inner.put(&shard_key("blocks", store_id, &id), data).await?;
        Ok(id)
    }
}

/// Aggregate returned by [`FsStore::file_count_info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCountInfo {
    pub size: i64,
    pub file_count: i64,
}

/// Store for file and directory objects.
#[derive(Clone)]
pub struct FsStore {
    inner: Arc<dyn ObjectStore>,
}

impl FsStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub async fn exists(&self, store_id: &str, id: &ObjectId) -> RepoResult<bool> {
        Ok(self.inner.exists(&shard_key("fs", store_id, id)).await?)
    }

    pub async fn get_file(&self, store_id: &str, id: &ObjectId) -> RepoResult<FileObject> {
        let bytes = self.get_obj(store_id, id).await?;
        Ok(FileObject::decode(&bytes)?)
    }

    pub async fn save_file(&self, store_id: &str, file: &FileObject) -> RepoResult<ObjectId> {
        let (id, bytes) = file.encode()?;
        self.inner
            .put(&shard_key("fs", store_id, &id), Bytes::from(bytes))
            .await?;
        Ok(id)
    }

    pub async fn get_dir(&self, store_id: &str, id: &ObjectId) -> RepoResult<Directory> {
        if id.is_zero() {
            return Ok(Directory::empty());
        }
        let bytes = self.get_obj(store_id, id).await?;
        Ok(Directory::decode(&bytes)?)
    }

    pub async fn save_dir(&self, store_id: &str, dir: &Directory) -> RepoResult<ObjectId> {
        let (id, bytes) = dir.encode()?;
        self.inner
            .put(&shard_key("fs", store_id, &id), Bytes::from(bytes))
            .await?;
        Ok(id)
    }

    async fn get_obj(&self, store_id: &str, id: &ObjectId) -> RepoResult<Bytes> {
        match self.inner.get(&shard_key("fs", store_id, id)).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotFound(_)) => {
                Err(RepoError::NotFound(format!("fs object {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the directory entry at `path` under `root`, or None if any
    /// segment is missing.
    pub async fn get_dirent_by_path(
        &self,
        store_id: &str,
        root: &ObjectId,
        path: &str,
    ) -> RepoResult<Option<DirEntry>> {
        let canon = canon_path(path);
        let mut dir = self.get_dir(store_id, root).await?;
        let mut found: Option<DirEntry> = None;
        for seg in canon.split('/').filter(|s| !s.is_empty()) {
            let Some(entry) = dir.get(seg).cloned() else {
                return Ok(None);
            };
            if entry.is_dir() {
                dir = self.get_dir(store_id, &entry.id).await?;
            } else {
                dir = Directory::empty();
            }
            found = Some(entry);
        }
        Ok(found)
    }

    /// Load the directory object at `path` under `root`.
    pub async fn get_dir_by_path(
        &self,
        store_id: &str,
        root: &ObjectId,
        path: &str,
    ) -> RepoResult<Directory> {
        let id = self
            .get_dir_id_by_path(store_id, root, path)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("dir {path}")))?;
        self.get_dir(store_id, &id).await
    }

    /// Resolve the directory id at `path` under `root`, or None if the
    /// path is missing or names a regular file.
    pub async fn get_dir_id_by_path(
        &self,
        store_id: &str,
        root: &ObjectId,
        path: &str,
    ) -> RepoResult<Option<ObjectId>> {
        let canon = canon_path(path);
        if canon == "/" || canon.is_empty() {
            return Ok(Some(*root));
        }
        match self.get_dirent_by_path(store_id, root, &canon).await? {
            Some(entry) if entry.is_dir() => Ok(Some(entry.id)),
            _ => Ok(None),
        }
    }

    /// Sum size and file count of the whole tree under `root`.
    pub async fn file_count_info(
        &self,
        store_id: &str,
        root: &ObjectId,
    ) -> RepoResult<FileCountInfo> {
        let mut info = FileCountInfo::default();
        let mut stack = vec![*root];
        while let Some(dir_id) = stack.pop() {
            let dir = self.get_dir(store_id, &dir_id).await?;
            for entry in &dir.entries {
                if entry.is_dir() {
                    if !entry.id.is_zero() {
                        stack.push(entry.id);
                    }
                } else {
                    info.file_count += 1;
                    info.size += entry.size;
                }
            }
        }
        Ok(info)
    }
}

/// Store for commit objects.
#[derive(Clone)]
pub struct CommitStore {
    inner: Arc<dyn ObjectStore>,
}

impl CommitStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub async fn load(&self, repo_id: &str, id: &ObjectId) -> RepoResult<Commit> {
        match self.inner.get(&shard_key("commits", repo_id, id)).await {
            Ok(bytes) => Ok(Commit::decode(&bytes)?),
            Err(StorageError::NotFound(_)) => {
                Err(RepoError::NotFound(format!("commit {repo_id}/{id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, commit: &Commit) -> RepoResult<()> {
        let bytes = commit.encode()?;
        self.inner
            .put(
                &shard_key("commits", &commit.repo_id, &commit.commit_id),
                Bytes::from(bytes),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_core::{MODE_DIR, MODE_REG};
    use reef_storage::FilesystemBackend;
    use tempfile::tempdir;

    async fn fs_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, FsStore::new(Arc::new(backend)))
    }

    fn file_entry(name: &str, id: ObjectId, size: i64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id,
            mode: MODE_REG,
            mtime: 1_700_000_000,
            size,
            modifier: "alice".to_string(),
        }
    }

    fn dir_entry(name: &str, id: ObjectId) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id,
            mode: MODE_DIR,
            mtime: 1_700_000_000,
            size: 0,
            modifier: String::new(),
        }
    }

    #[tokio::test]
    async fn dir_path_resolution() {
        let (_tmp, fs) = fs_store().await;
        let store = "s1";

        let leaf = Directory::new(vec![file_entry("a.txt", ObjectId::compute(b"a"), 3)]);
        let leaf_id = fs.save_dir(store, &leaf).await.unwrap();
        let mid = Directory::new(vec![dir_entry("docs", leaf_id)]);
        let mid_id = fs.save_dir(store, &mid).await.unwrap();
        let root = Directory::new(vec![dir_entry("home", mid_id)]);
        let root_id = fs.save_dir(store, &root).await.unwrap();

        assert_eq!(
            fs.get_dir_id_by_path(store, &root_id, "/home/docs").await.unwrap(),
            Some(leaf_id)
        );
        assert_eq!(
            fs.get_dir_id_by_path(store, &root_id, "/").await.unwrap(),
            Some(root_id)
        );
        assert_eq!(
            fs.get_dir_id_by_path(store, &root_id, "/missing").await.unwrap(),
            None
        );
        // A file path does not resolve as a directory.
        assert_eq!(
            fs.get_dir_id_by_path(store, &root_id, "/home/docs/a.txt")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn file_count_walks_tree() {
        let (_tmp, fs) = fs_store().await;
        let store = "s1";

        let leaf = Directory::new(vec![
            file_entry("a", ObjectId::compute(b"a"), 10),
            file_entry("b", ObjectId::compute(b"b"), 20),
        ]);
        let leaf_id = fs.save_dir(store, &leaf).await.unwrap();
        let root = Directory::new(vec![
            dir_entry("sub", leaf_id),
            file_entry("top", ObjectId::compute(b"t"), 5),
        ]);
        let root_id = fs.save_dir(store, &root).await.unwrap();

        let info = fs.file_count_info(store, &root_id).await.unwrap();
        assert_eq!(info, FileCountInfo { size: 35, file_count: 3 });
    }

    #[tokio::test]
    async fn zero_dir_id_reads_as_empty() {
        let (_tmp, fs) = fs_store().await;
        let dir = fs.get_dir("s1", &reef_core::ZERO_OBJ_ID).await.unwrap();
        assert!(dir.entries.is_empty());
    }
}
