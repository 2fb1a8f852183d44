//! Tree diffing.
//!
//! Produces per-file ADDED/DELETED/MODIFIED entries plus directory
//! add/delete/rename events. A directory rename is recognized by its
//! object id reappearing under a different name, which is exactly what a
//! pure rename produces in a content-addressed tree.

use crate::error::RepoResult;
use crate::store::FsStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use reef_core::fs::DirEntry;
use reef_core::ObjectId;

/// Kind of change a diff entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Deleted,
    Modified,
    DirAdded,
    DirDeleted,
    DirRenamed,
}

/// One entry of a tree diff. Paths have no leading slash.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub status: DiffStatus,
    /// Path in the old tree (new tree for pure additions).
    pub path: String,
    /// For renames: path in the new tree.
    pub new_path: Option<String>,
    /// For directory entries: the directory object id.
    pub dir_id: Option<ObjectId>,
    /// File size in the new tree (0 for deletions).
    pub size: i64,
    /// File size in the old tree (only set for modifications).
    pub origin_size: i64,
}

impl DiffEntry {
    fn file(status: DiffStatus, path: String, size: i64, origin_size: i64) -> Self {
        Self {
            status,
            path,
            new_path: None,
            dir_id: None,
            size,
            origin_size,
        }
    }

    fn dir(status: DiffStatus, path: String, id: ObjectId) -> Self {
        Self {
            status,
            path,
            new_path: None,
            dir_id: Some(id),
            size: 0,
            origin_size: 0,
        }
    }
}

/// Diff two roots.
///
/// With `detect_renames`, a directory deleted in one place and re-added
/// with the same id elsewhere folds into a single `DirRenamed` entry
/// (the per-file churn beneath it is dropped).
pub async fn diff_trees(
    fs: &FsStore,
    store_id: &str,
    old_root: &ObjectId,
    new_root: &ObjectId,
    detect_renames: bool,
) -> RepoResult<Vec<DiffEntry>> {
    let mut out = Vec::new();
    let mut added_dirs: Vec<(String, ObjectId)> = Vec::new();
    let mut deleted_dirs: Vec<(String, ObjectId)> = Vec::new();
    walk(
        fs,
        store_id,
        Some(*old_root),
        Some(*new_root),
        String::new(),
        &mut out,
        &mut added_dirs,
        &mut deleted_dirs,
    )
    .await?;

    if detect_renames {
        let mut renamed: Vec<(String, String, ObjectId)> = Vec::new();
        deleted_dirs.retain(|(old_path, old_id)| {
            if let Some(pos) = added_dirs.iter().position(|(_, new_id)| new_id == old_id) {
                let (new_path, _) = added_dirs.remove(pos);
                renamed.push((old_path.clone(), new_path, *old_id));
                false
            } else {
                true
            }
        });
        for (old_path, new_path, id) in renamed {
            out.push(DiffEntry {
                status: DiffStatus::DirRenamed,
                path: old_path,
                new_path: Some(new_path),
                dir_id: Some(id),
                size: 0,
                origin_size: 0,
            });
        }
    }

    // Surviving dir adds/deletes expand into their file contents so size
    // accounting sees every file exactly once.
    for (path, id) in added_dirs {
        out.push(DiffEntry::dir(DiffStatus::DirAdded, path.clone(), id));
        collect_files(fs, store_id, &id, path, DiffStatus::Added, &mut out).await?;
    }
    for (path, id) in deleted_dirs {
        out.push(DiffEntry::dir(DiffStatus::DirDeleted, path.clone(), id));
        collect_files(fs, store_id, &id, path, DiffStatus::Deleted, &mut out).await?;
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn walk<'a>(
    fs: &'a FsStore,
    store_id: &'a str,
    old_id: Option<ObjectId>,
    new_id: Option<ObjectId>,
    path: String,
    out: &'a mut Vec<DiffEntry>,
    added_dirs: &'a mut Vec<(String, ObjectId)>,
    deleted_dirs: &'a mut Vec<(String, ObjectId)>,
) -> BoxFuture<'a, RepoResult<()>> {
    async move {
        if old_id == new_id {
            return Ok(());
        }
        let old_dir = match old_id {
            Some(id) => fs.get_dir(store_id, &id).await?,
            None => reef_core::fs::Directory::empty(),
        };
        let new_dir = match new_id {
            Some(id) => fs.get_dir(store_id, &id).await?,
            None => reef_core::fs::Directory::empty(),
        };

        for entry in &new_dir.entries {
            let child = join(&path, &entry.name);
            match old_dir.get(&entry.name) {
                None => {
                    if entry.is_dir() {
                        added_dirs.push((child, entry.id));
                    } else {
                        out.push(DiffEntry::file(DiffStatus::Added, child, entry.size, 0));
                    }
                }
                Some(old) if old.id == entry.id && old.is_dir() == entry.is_dir() => {}
                Some(old) => match (old.is_dir(), entry.is_dir()) {
                    (true, true) => {
                        walk(
                            fs,
                            store_id,
                            Some(old.id),
                            Some(entry.id),
                            child,
                            out,
                            added_dirs,
                            deleted_dirs,
                        )
                        .await?;
                    }
                    (false, false) => {
                        out.push(DiffEntry::file(
                            DiffStatus::Modified,
                            child,
                            entry.size,
                            old.size,
                        ));
                    }
                    (true, false) => {
                        deleted_dirs.push((child.clone(), old.id));
                        out.push(DiffEntry::file(DiffStatus::Added, child, entry.size, 0));
                    }
                    (false, true) => {
                        out.push(DiffEntry::file(DiffStatus::Deleted, child.clone(), 0, old.size));
                        added_dirs.push((child, entry.id));
                    }
                },
            }
        }

        for old in &old_dir.entries {
            if new_dir.get(&old.name).is_some() {
                continue;
            }
            let child = join(&path, &old.name);
            if old.is_dir() {
                deleted_dirs.push((child, old.id));
            } else {
                out.push(DiffEntry::file(DiffStatus::Deleted, child, 0, old.size));
            }
        }

        Ok(())
    }
    .boxed()
}

/// Emit one entry per file under `dir_id` with the given status.
async fn collect_files(
    fs: &FsStore,
    store_id: &str,
    dir_id: &ObjectId,
    path: String,
    status: DiffStatus,
    out: &mut Vec<DiffEntry>,
) -> RepoResult<()> {
    let mut stack = vec![(*dir_id, path)];
    while let Some((id, path)) = stack.pop() {
        let dir = fs.get_dir(store_id, &id).await?;
        for entry in &dir.entries {
            let child = join(&path, &entry.name);
            if entry.is_dir() {
                if !entry.id.is_zero() {
                    stack.push((entry.id, child));
                }
            } else {
                match status {
                    DiffStatus::Added => {
                        out.push(DiffEntry::file(DiffStatus::Added, child, entry.size, 0))
                    }
                    _ => out.push(DiffEntry::file(DiffStatus::Deleted, child, 0, entry.size)),
                }
            }
        }
    }
    Ok(())
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn file_name(entry_path: &str) -> &str {
    entry_path.rsplit('/').next().unwrap_or(entry_path)
}

/// Render a human-readable commit description from diff results.
pub fn diff_results_to_desc(results: &[DiffEntry]) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mut describe = |status: DiffStatus, verb: &str| {
        let matching: Vec<&DiffEntry> = results.iter().filter(|d| d.status == status).collect();
        match matching.len() {
            0 => {}
            1 => lines.push(format!("{verb} \"{}\".", file_name(&matching[0].path))),
            n => lines.push(format!(
                "{verb} \"{}\" and {} more files.",
                file_name(&matching[0].path),
                n - 1
            )),
        }
    };
    describe(DiffStatus::Added, "Added");
    describe(DiffStatus::Deleted, "Deleted");
    describe(DiffStatus::Modified, "Modified");

    for d in results {
        match d.status {
            DiffStatus::DirAdded => {
                lines.push(format!("Added directory \"{}\".", file_name(&d.path)))
            }
            DiffStatus::DirDeleted => {
                lines.push(format!("Removed directory \"{}\".", file_name(&d.path)))
            }
            DiffStatus::DirRenamed => lines.push(format!(
                "Renamed directory \"{}\".",
                file_name(&d.path)
            )),
            _ => {}
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use reef_core::fs::Directory;
    use reef_core::{MODE_DIR, MODE_REG};
    use reef_storage::FilesystemBackend;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn fs_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        (dir, FsStore::new(Arc::new(backend)))
    }

    fn file_dent(name: &str, seed: &[u8], size: i64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id: ObjectId::compute(seed),
            mode: MODE_REG,
            mtime: 0,
            size,
            modifier: String::new(),
        }
    }

    fn dir_dent(name: &str, id: ObjectId) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id,
            mode: MODE_DIR,
            mtime: 0,
            size: 0,
            modifier: String::new(),
        }
    }

    #[tokio::test]
    async fn detects_added_deleted_modified() {
        let (_tmp, fs) = fs_store().await;

        let old = Directory::new(vec![
            file_dent("keep", b"k", 1),
            file_dent("gone", b"g", 2),
            file_dent("changed", b"v1", 3),
        ]);
        let old_id = fs.save_dir("s", &old).await.unwrap();
        let new = Directory::new(vec![
            file_dent("keep", b"k", 1),
            file_dent("changed", b"v2", 7),
            file_dent("fresh", b"f", 5),
        ]);
        let new_id = fs.save_dir("s", &new).await.unwrap();

        let diff = diff_trees(&fs, "s", &old_id, &new_id, false).await.unwrap();
        let find = |status, path: &str| {
            diff.iter()
                .find(|d| d.status == status && d.path == path)
                .cloned()
        };
        assert!(find(DiffStatus::Added, "fresh").is_some());
        assert!(find(DiffStatus::Deleted, "gone").is_some());
        let modified = find(DiffStatus::Modified, "changed").unwrap();
        assert_eq!((modified.size, modified.origin_size), (7, 3));
        assert!(find(DiffStatus::Added, "keep").is_none());
    }

    #[tokio::test]
    async fn folds_dir_rename() {
        let (_tmp, fs) = fs_store().await;

        let sub = Directory::new(vec![file_dent("a", b"a", 1)]);
        let sub_id = fs.save_dir("s", &sub).await.unwrap();
        let old = Directory::new(vec![dir_dent("src", sub_id)]);
        let old_id = fs.save_dir("s", &old).await.unwrap();
        let new = Directory::new(vec![dir_dent("source", sub_id)]);
        let new_id = fs.save_dir("s", &new).await.unwrap();

        let diff = diff_trees(&fs, "s", &old_id, &new_id, true).await.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].status, DiffStatus::DirRenamed);
        assert_eq!(diff[0].path, "src");
        assert_eq!(diff[0].new_path.as_deref(), Some("source"));
        assert_eq!(diff[0].dir_id, Some(sub_id));

        // Without rename detection the same trees read as delete + add.
        let diff = diff_trees(&fs, "s", &old_id, &new_id, false).await.unwrap();
        assert!(diff.iter().any(|d| d.status == DiffStatus::DirAdded));
        assert!(diff.iter().any(|d| d.status == DiffStatus::DirDeleted));
        assert!(diff
            .iter()
            .any(|d| d.status == DiffStatus::Added && d.path == "source/a"));
    }

    #[tokio::test]
    async fn added_dir_expands_files() {
        let (_tmp, fs) = fs_store().await;

        let old_id = fs.save_dir("s", &Directory::empty()).await.unwrap();
        let sub = Directory::new(vec![file_dent("x", b"x", 10), file_dent("y", b"y", 20)]);
        let sub_id = fs.save_dir("s", &sub).await.unwrap();
        let new = Directory::new(vec![dir_dent("d", sub_id)]);
        let new_id = fs.save_dir("s", &new).await.unwrap();

        let diff = diff_trees(&fs, "s", &old_id, &new_id, true).await.unwrap();
        let added: i64 = diff
            .iter()
            .filter(|d| d.status == DiffStatus::Added)
            .map(|d| d.size)
            .sum();
        assert_eq!(added, 30);
    }

    #[test]
    fn desc_counts_files() {
        let results = vec![
            DiffEntry::file(DiffStatus::Added, "d/a.txt".into(), 1, 0),
            DiffEntry::file(DiffStatus::Added, "d/b.txt".into(), 1, 0),
            DiffEntry::file(DiffStatus::Deleted, "old.txt".into(), 0, 2),
        ];
        let desc = diff_results_to_desc(&results);
        assert!(desc.contains("Added \"a.txt\" and 1 more files."));
        assert!(desc.contains("Deleted \"old.txt\"."));
    }
}
