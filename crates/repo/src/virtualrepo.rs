//! Virtual-repo synchronization.
//!
//! A virtual repo pins its root to a sub-path of an origin library. After
//! any committing mutation on either side the two are reconciled: the
//! unchanged side fast-forwards, diverged sides go through a three-way
//! merge written into both, and a vanished mount path is healed by
//! following directory renames (or the anchor row is tombstoned).

use crate::commit::{rename_repo, update_dir};
use crate::diff::{diff_trees, DiffStatus};
use crate::error::{RepoError, RepoResult};
use crate::merge::merge_trees;
use crate::registry::{Repo, RepoManager};
use futures::future::BoxFuture;
use futures::FutureExt;
use reef_core::fs::Commit;
use reef_core::path::base_name;
use reef_metadata::models::VirtualRepoRow;
use reef_metadata::VirtualRepoRepo;

/// Reconcile a repo with its counterpart(s).
///
/// For a virtual repo, syncs it against its origin. For an origin, syncs
/// every virtual repo mounted on it (skipping `exclude`, the repo that
/// triggered the sweep). Failures are logged and swallowed; the
/// triggering mutation already committed.
pub fn merge_virtual_repo<'a>(
    mgr: &'a RepoManager,
    repo_id: &'a str,
    exclude: Option<&'a str>,
) -> BoxFuture<'a, ()> {
    async move {
        let virtual_info = match mgr.metadata.get_virtual_info(repo_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(repo_id, error = %e, "failed to look up virtual info");
                return;
            }
        };

        if virtual_info.is_some() {
            if let Err(e) = merge_repo(mgr, repo_id).await {
                tracing::warn!(repo_id, error = %e, "virtual repo sync failed");
            }
            return;
        }

        let virtuals = match mgr.metadata.get_virtual_info_by_origin(repo_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(repo_id, error = %e, "failed to list virtual repos");
                return;
            }
        };
        for row in virtuals {
            if Some(row.repo_id.as_str()) == exclude {
                continue;
            }
            if let Err(e) = merge_repo(mgr, &row.repo_id).await {
                tracing::warn!(repo_id = %row.repo_id, error = %e, "virtual repo sync failed");
            }
        }
    }
    .boxed()
}

/// Sync one virtual repo against its origin.
pub async fn merge_repo(mgr: &RepoManager, repo_id: &str) -> RepoResult<()> {
    let repo = mgr.get(repo_id).await?;
    let Some(vinfo) = repo.virtual_info.clone() else {
        return Ok(());
    };
    let origin = mgr.get(&vinfo.origin_repo).await?;

    let head = mgr.commits.load(&repo.id, &repo.head_commit_id).await?;
    let origin_head = mgr.commits.load(&origin.id, &origin.head_commit_id).await?;

    // Resolve the mount point in the origin head, healing a vanished path.
    let mut path = vinfo.path.clone();
    let mut origin_root = mgr
        .fs
        .get_dir_id_by_path(&origin.store_id, &origin_head.root_id, &path)
        .await?;
    if origin_root.is_none() {
        if let Some(new_path) =
            handle_missing_virtual_repo(mgr, &origin, &origin_head, &vinfo).await?
        {
            origin_root = mgr
                .fs
                .get_dir_id_by_path(&origin.store_id, &origin_head.root_id, &new_path)
                .await?;
            path = new_path;
        }
    }
    let Some(origin_root) = origin_root else {
        return Err(RepoError::NotFound(format!(
            "path {} in origin repo {}",
            vinfo.path, vinfo.origin_repo
        )));
    };

    let base = mgr
        .commits
        .load(&origin.id, &reef_core::ObjectId::from_hex(&vinfo.base_commit)?)
        .await?;
    let root = head.root_id;
    // The base commit predates any healing, so the anchor's recorded path
    // is the one that exists under it.
    let base_root = mgr
        .fs
        .get_dir_id_by_path(&origin.store_id, &base.root_id, &vinfo.path)
        .await?
        .ok_or_else(|| {
            RepoError::NotFound(format!(
                "base dir {} in origin repo {}",
                vinfo.path, origin.id
            ))
        })?;

    if root == origin_root {
        // Case a: in sync.
    } else if base_root == root {
        // Case b: origin moved, virtual didn't; fast-forward the virtual.
        update_dir(
            mgr,
            &repo.id,
            "/",
            origin_root,
            &origin_head.creator_name,
            Some(head.commit_id),
        )
        .await?;
        mgr.metadata
            .set_virtual_repo_base_commit_path(&repo.id, &origin_head.commit_id.to_hex(), &path)
            .await?;
    } else if base_root == origin_root {
        // Case c: virtual moved, origin didn't; splice into the origin.
        update_dir(
            mgr,
            &origin.id,
            &path,
            root,
            &head.creator_name,
            Some(origin_head.commit_id),
        )
        .await?;
        let new_origin = mgr.get(&origin.id).await?;
        mgr.metadata
            .set_virtual_repo_base_commit_path(&repo.id, &new_origin.head_commit_id.to_hex(), &path)
            .await?;
        cleanup_virtual_repos(mgr, &origin.id).await?;
        merge_virtual_repo(mgr, &origin.id, Some(&repo.id)).await;
    } else {
        // Case d: both moved; merge and write the result into both sides.
        let merge = merge_trees(
            &mgr.fs,
            &repo.store_id,
            &base_root,
            &origin_root,
            &root,
            &head.creator_name,
        )
        .await?;

        update_dir(
            mgr,
            &repo.id,
            "/",
            merge.root,
            &origin_head.creator_name,
            Some(head.commit_id),
        )
        .await?;
        let new_base = update_dir(
            mgr,
            &origin.id,
            &path,
            merge.root,
            &head.creator_name,
            Some(origin_head.commit_id),
        )
        .await?;
        mgr.metadata
            .set_virtual_repo_base_commit_path(&repo.id, &new_base.to_hex(), &path)
            .await?;
        cleanup_virtual_repos(mgr, &origin.id).await?;
        merge_virtual_repo(mgr, &origin.id, Some(&repo.id)).await;
    }

    Ok(())
}

/// Heal every virtual repo of an origin whose mount path vanished.
pub async fn cleanup_virtual_repos(mgr: &RepoManager, origin_id: &str) -> RepoResult<()> {
    let origin = mgr.get(origin_id).await?;
    let head = mgr.commits.load(&origin.id, &origin.head_commit_id).await?;

    for vinfo in mgr.metadata.get_virtual_info_by_origin(origin_id).await? {
        let found = mgr
            .fs
            .get_dir_id_by_path(&origin.store_id, &head.root_id, &vinfo.path)
            .await?;
        if found.is_none() {
            handle_missing_virtual_repo(mgr, &origin, &head, &vinfo).await?;
        }
    }
    Ok(())
}

/// Recover the mount path of a virtual repo after it disappeared from the
/// origin head.
///
/// Diffs the head against its parent with rename detection and walks the
/// old path upward one segment at a time; if an ancestor's old directory
/// id shows up as the source of a rename, the new mount path is the
/// renamed target joined with the accumulated suffix. Without a rename
/// the anchor row is deleted. Returns the new path if one was found.
pub async fn handle_missing_virtual_repo(
    mgr: &RepoManager,
    origin: &Repo,
    head: &Commit,
    vinfo: &VirtualRepoRow,
) -> RepoResult<Option<String>> {
    let Some(parent_id) = head.parent_id else {
        mgr.metadata.del_virtual_repo(&vinfo.repo_id).await?;
        return Ok(None);
    };
    let parent = mgr.commits.load(&head.repo_id, &parent_id).await?;

    let results = diff_trees(
        &mgr.fs,
        &origin.store_id,
        &parent.root_id,
        &head.root_id,
        true,
    )
    .await?;

    let mut par_path = vinfo.path.clone();
    let mut sub_path = String::new();
    loop {
        let old_dir_id = mgr
            .fs
            .get_dir_id_by_path(&origin.store_id, &parent.root_id, &par_path)
            .await?
            .ok_or_else(|| {
                RepoError::NotFound(format!(
                    "path {} under parent commit of {}",
                    par_path, origin.id
                ))
            })?;

        for de in &results {
            if de.status != DiffStatus::DirRenamed || de.dir_id != Some(old_dir_id) {
                continue;
            }
            let renamed_to = de.new_path.as_deref().unwrap_or_default();
            let new_path = if sub_path.is_empty() {
                format!("/{renamed_to}")
            } else {
                format!("/{renamed_to}/{sub_path}")
            };
            mgr.metadata
                .set_virtual_repo_base_commit_path(
                    &vinfo.repo_id,
                    &head.commit_id.to_hex(),
                    &new_path,
                )
                .await?;
            if sub_path.is_empty() {
                // The mount point itself was renamed; rename the library.
                let new_name = base_name(&new_path);
                if let Err(e) = rename_repo(mgr, &vinfo.repo_id, &new_name, None).await {
                    tracing::warn!(repo_id = %vinfo.repo_id, error = %e, "failed to rename library");
                }
            }
            return Ok(Some(new_path));
        }

        // Walk one segment up.
        let (parent_path, name) = reef_core::path::split_parent(&par_path);
        if name.is_empty() || parent_path == par_path {
            break;
        }
        sub_path = if sub_path.is_empty() {
            name
        } else {
            format!("{name}/{sub_path}")
        };
        if parent_path == "/" {
            break;
        }
        par_path = parent_path;
    }

    mgr.metadata.del_virtual_repo(&vinfo.repo_id).await?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::gen_new_commit;
    use crate::tree;
    use reef_core::fs::DirEntry;
    use reef_core::{ObjectId, MODE_REG};
    use reef_metadata::SqliteStore;
    use reef_storage::FilesystemBackend;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn manager() -> (tempfile::TempDir, Arc<RepoManager>) {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(
            SqliteStore::new(dir.path().join("metadata.db")).await.unwrap(),
        );
        let objects = Arc::new(
            FilesystemBackend::new(dir.path().join("objects")).await.unwrap(),
        );
        (dir, Arc::new(RepoManager::new(metadata, objects)))
    }

    fn file_dent(name: &str, seed: &[u8]) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id: ObjectId::compute(seed),
            mode: MODE_REG,
            mtime: crate::registry::now(),
            size: seed.len() as i64,
            modifier: String::new(),
        }
    }

    /// Post a file into `path` of `repo_id` and commit.
    async fn commit_file(mgr: &RepoManager, repo_id: &str, path: &str, dent: DirEntry) {
        let repo = mgr.get(repo_id).await.unwrap();
        let base = mgr.commits.load(&repo.id, &repo.head_commit_id).await.unwrap();
        let mut names = Vec::new();
        let new_root = tree::post_multi_files(
            &mgr.fs,
            &repo.store_id,
            &repo.root_id,
            path,
            &[dent],
            false,
            "alice",
            &mut names,
        )
        .await
        .unwrap();
        gen_new_commit(mgr, &repo, &base, new_root, "alice", "upload")
            .await
            .unwrap();
    }

    /// Origin repo with `/src/seed.txt` plus a virtual repo mounted at /src.
    async fn origin_with_virtual(mgr: &Arc<RepoManager>) {
        mgr.create_repo("origin", "origin", "alice").await.unwrap();
        crate::commit::mkdir_with_parents(mgr, "origin", "/", "src", "alice")
            .await
            .unwrap();
        commit_file(mgr, "origin", "/src", file_dent("seed.txt", b"seed")).await;
        mgr.create_virtual_repo("virt", "origin", "/src", "alice")
            .await
            .unwrap();
    }

    /// The virtual mount invariant: dir at the mount path equals the
    /// virtual head root.
    async fn assert_mounted(mgr: &RepoManager, path: &str) {
        let origin = mgr.get("origin").await.unwrap();
        let virt = mgr.get("virt").await.unwrap();
        let mounted = mgr
            .fs
            .get_dir_id_by_path(&origin.store_id, &origin.root_id, path)
            .await
            .unwrap();
        assert_eq!(mounted, Some(virt.root_id));
    }

    #[tokio::test]
    async fn case_a_in_sync_is_a_noop() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        let before = mgr.get("virt").await.unwrap();
        merge_repo(&mgr, "virt").await.unwrap();
        let after = mgr.get("virt").await.unwrap();
        assert_eq!(before.head_commit_id, after.head_commit_id);
        assert_mounted(&mgr, "/src").await;
    }

    #[tokio::test]
    async fn case_b_origin_changed_fast_forwards_virtual() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        commit_file(&mgr, "origin", "/src", file_dent("from-origin.txt", b"o")).await;
        merge_repo(&mgr, "virt").await.unwrap();

        let virt = mgr.get("virt").await.unwrap();
        let root = mgr.fs.get_dir(&virt.store_id, &virt.root_id).await.unwrap();
        assert!(root.get("from-origin.txt").is_some());
        assert_mounted(&mgr, "/src").await;

        // Base commit advanced to the origin head.
        let vinfo = mgr.metadata.get_virtual_info("virt").await.unwrap().unwrap();
        let origin = mgr.get("origin").await.unwrap();
        assert_eq!(vinfo.base_commit, origin.head_commit_id.to_hex());
    }

    #[tokio::test]
    async fn case_c_virtual_changed_splices_into_origin() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        commit_file(&mgr, "virt", "/", file_dent("from-virtual.txt", b"v")).await;
        merge_repo(&mgr, "virt").await.unwrap();

        let origin = mgr.get("origin").await.unwrap();
        let src = mgr
            .fs
            .get_dir_by_path(&origin.store_id, &origin.root_id, "/src")
            .await
            .unwrap();
        assert!(src.get("from-virtual.txt").is_some());
        assert_mounted(&mgr, "/src").await;
    }

    #[tokio::test]
    async fn case_d_both_changed_merges_both_sides() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        commit_file(&mgr, "origin", "/src", file_dent("from-origin.txt", b"o")).await;
        commit_file(&mgr, "virt", "/", file_dent("from-virtual.txt", b"v")).await;
        merge_repo(&mgr, "virt").await.unwrap();

        let origin = mgr.get("origin").await.unwrap();
        let src = mgr
            .fs
            .get_dir_by_path(&origin.store_id, &origin.root_id, "/src")
            .await
            .unwrap();
        assert!(src.get("from-origin.txt").is_some());
        assert!(src.get("from-virtual.txt").is_some());

        let virt = mgr.get("virt").await.unwrap();
        let vroot = mgr.fs.get_dir(&virt.store_id, &virt.root_id).await.unwrap();
        assert!(vroot.get("from-origin.txt").is_some());
        assert!(vroot.get("from-virtual.txt").is_some());
        assert_mounted(&mgr, "/src").await;
    }

    #[tokio::test]
    async fn renamed_mount_path_heals_and_renames_library() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        // Rename /src to /source in the origin via a direct tree rewrite.
        let origin = mgr.get("origin").await.unwrap();
        let base = mgr.commits.load(&origin.id, &origin.head_commit_id).await.unwrap();
        let root_dir = mgr.fs.get_dir(&origin.store_id, &origin.root_id).await.unwrap();
        let mut entries = root_dir.entries.clone();
        let src = entries.iter_mut().find(|e| e.name == "src").unwrap();
        src.name = "source".to_string();
        let new_root = mgr
            .fs
            .save_dir(&origin.store_id, &reef_core::fs::Directory::new(entries))
            .await
            .unwrap();
        gen_new_commit(&mgr, &origin, &base, new_root, "alice", "Renamed directory \"src\".")
            .await
            .unwrap();

        merge_repo(&mgr, "virt").await.unwrap();

        let vinfo = mgr.metadata.get_virtual_info("virt").await.unwrap().unwrap();
        assert_eq!(vinfo.path, "/source");
        let virt = mgr.get("virt").await.unwrap();
        assert_eq!(virt.name, "source");
        let head = mgr.commits.load("virt", &virt.head_commit_id).await.unwrap();
        assert_eq!(head.desc, "Changed library name");
        assert_mounted(&mgr, "/source").await;
    }

    #[tokio::test]
    async fn vanished_mount_path_tombstones_the_anchor() {
        let (_tmp, mgr) = manager().await;
        origin_with_virtual(&mgr).await;

        // Delete /src outright.
        let origin = mgr.get("origin").await.unwrap();
        let base = mgr.commits.load(&origin.id, &origin.head_commit_id).await.unwrap();
        let root_dir = mgr.fs.get_dir(&origin.store_id, &origin.root_id).await.unwrap();
        let entries: Vec<_> = root_dir
            .entries
            .iter()
            .filter(|e| e.name != "src")
            .cloned()
            .collect();
        let new_root = mgr
            .fs
            .save_dir(&origin.store_id, &reef_core::fs::Directory::new(entries))
            .await
            .unwrap();
        gen_new_commit(&mgr, &origin, &base, new_root, "alice", "Deleted \"src\".")
            .await
            .unwrap();

        assert!(merge_repo(&mgr, "virt").await.is_err());
        assert!(mgr.metadata.get_virtual_info("virt").await.unwrap().is_none());
    }
}
