//! Commit generation and branch advancement.
//!
//! A new commit lands via compare-and-swap on the master branch pointer.
//! When a concurrent writer got there first the new root is re-merged
//! against the fresh head and the CAS retried, up to 3 times with
//! randomized backoff.

use crate::diff::{diff_results_to_desc, diff_trees};
use crate::error::{RepoError, RepoResult};
use crate::merge::merge_trees;
use crate::registry::{now, Repo, RepoManager};
use crate::tree;
use rand::Rng;
use reef_core::fs::{Commit, DirEntry};
use reef_core::path::{canon_path, split_parent};
use reef_core::{ObjectId, MODE_DIR, ZERO_OBJ_ID};
use reef_metadata::models::RepoInfoRow;
use reef_metadata::{BranchRepo, RegistryRepo};
use std::time::Duration;

const MAX_CAS_RETRIES: u32 = 3;

/// Build an (unsaved) commit for `repo` with a fresh ctime.
pub fn new_commit(
    repo: &Repo,
    parent_id: Option<ObjectId>,
    new_root: ObjectId,
    user: &str,
    desc: &str,
) -> Commit {
    let mut commit = Commit {
        commit_id: ZERO_OBJ_ID,
        repo_id: repo.id.clone(),
        root_id: new_root,
        parent_id,
        second_parent_id: None,
        creator_id: "0".repeat(40),
        creator_name: user.to_string(),
        desc: desc.to_string(),
        ctime: now(),
        repo_name: repo.name.clone(),
        repo_desc: repo.desc.clone(),
        encrypted: repo.is_encrypted,
        enc_version: if repo.is_encrypted { repo.enc_version } else { 0 },
        magic: None,
        random_key: None,
        salt: None,
        version: repo.version,
        new_merge: false,
        conflict: false,
    };
    if repo.is_encrypted {
        commit.magic = repo.magic.clone();
        if repo.enc_version >= 2 {
            commit.random_key = repo.random_key.clone();
        }
        if repo.enc_version >= 3 {
            commit.salt = repo.salt.clone();
        }
    }
    commit.commit_id = commit.compute_id();
    commit
}

/// Create a commit with root `new_root` on top of `base`, advance master,
/// and return the id of the commit the branch now points at.
///
/// If the branch moved past `base` a three-way merge of
/// `(base.root, current head root, new_root)` produces a merge commit
/// instead; CAS failures back off 100–1000 ms and retry.
pub async fn gen_new_commit(
    mgr: &RepoManager,
    repo: &Repo,
    base: &Commit,
    new_root: ObjectId,
    user: &str,
    desc: &str,
) -> RepoResult<ObjectId> {
    let commit = new_commit(repo, Some(base.commit_id), new_root, user, desc);
    mgr.commits.save(&commit).await?;

    let mut retries = 0;
    loop {
        let branch = mgr
            .metadata
            .get_branch(&repo.id, "master")
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("branch master of {}", repo.id)))?;
        let head_id = ObjectId::from_hex(&branch.commit_id)?;
        let current_head = mgr.commits.load(&repo.id, &head_id).await?;

        let merged_commit = if base.commit_id != current_head.commit_id {
            let merge = merge_trees(
                &mgr.fs,
                &repo.store_id,
                &base.root_id,
                &current_head.root_id,
                &new_root,
                user,
            )
            .await?;

            let merge_desc = if !merge.conflict {
                "Auto merge by system".to_string()
            } else {
                let desc = gen_merge_desc(
                    mgr,
                    &repo.store_id,
                    &merge.root,
                    &current_head.root_id,
                    &new_root,
                )
                .await;
                if desc.is_empty() {
                    "Auto merge by system".to_string()
                } else {
                    desc
                }
            };

            let mut merged = new_commit(
                repo,
                Some(current_head.commit_id),
                merge.root,
                user,
                &merge_desc,
            );
            merged.second_parent_id = Some(commit.commit_id);
            merged.new_merge = true;
            merged.conflict = merge.conflict;
            mgr.commits.save(&merged).await?;
            merged
        } else {
            commit.clone()
        };

        match mgr
            .metadata
            .update_branch_cas(
                &repo.id,
                "master",
                &merged_commit.commit_id.to_hex(),
                &current_head.commit_id.to_hex(),
            )
            .await
        {
            Ok(()) => {
                update_repo_info(mgr, &repo.id, &merged_commit).await?;
                return Ok(merged_commit.commit_id);
            }
            Err(reef_metadata::MetadataError::StaleHead { .. }) => {
                if retries >= MAX_CAS_RETRIES {
                    return Err(RepoError::Contention(repo.id.clone()));
                }
                retries += 1;
                let backoff = rand::thread_rng().gen_range(100..1000);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Describe a plain update by diffing the new root against its parent.
pub async fn gen_commit_desc(
    mgr: &RepoManager,
    store_id: &str,
    root: &ObjectId,
    parent_root: &ObjectId,
) -> String {
    match diff_trees(&mgr.fs, store_id, parent_root, root, true).await {
        Ok(results) => diff_results_to_desc(&results),
        Err(_) => String::new(),
    }
}

/// Describe a conflict merge by diffing the merged root against both
/// parents.
async fn gen_merge_desc(
    mgr: &RepoManager,
    store_id: &str,
    merged_root: &ObjectId,
    p1_root: &ObjectId,
    p2_root: &ObjectId,
) -> String {
    let Ok(mut results) = diff_trees(&mgr.fs, store_id, p1_root, merged_root, true).await else {
        return String::new();
    };
    if let Ok(more) = diff_trees(&mgr.fs, store_id, p2_root, merged_root, true).await {
        results.extend(more);
    }
    diff_results_to_desc(&results)
}

/// Refresh the denormalized repo info row from a new head commit.
pub async fn update_repo_info(
    mgr: &RepoManager,
    repo_id: &str,
    head: &Commit,
) -> RepoResult<()> {
    mgr.metadata
        .upsert_repo_info(&RepoInfoRow {
            repo_id: repo_id.to_string(),
            name: head.repo_name.clone(),
            update_time: head.ctime,
            version: head.version as i64,
            is_encrypted: head.encrypted,
            last_modifier: head.creator_name.clone(),
        })
        .await?;
    Ok(())
}

/// Point the directory at `dir_path` to `new_dir_id` and commit.
///
/// `head_id` pins the base commit; None means the current master head.
/// Used by the virtual-repo synchronizer to splice subtree updates into
/// either side.
pub async fn update_dir(
    mgr: &RepoManager,
    repo_id: &str,
    dir_path: &str,
    new_dir_id: ObjectId,
    user: &str,
    head_id: Option<ObjectId>,
) -> RepoResult<ObjectId> {
    let repo = mgr.get(repo_id).await?;
    let base_id = head_id.unwrap_or(repo.head_commit_id);
    let head_commit = mgr.commits.load(&repo.id, &base_id).await?;

    let canon = canon_path(dir_path);
    if canon == "/" {
        let mut desc = gen_commit_desc(mgr, &repo.store_id, &new_dir_id, &head_commit.root_id).await;
        if desc.is_empty() {
            desc = "Auto merge by system".to_string();
        }
        return gen_new_commit(mgr, &repo, &head_commit, new_dir_id, user, &desc).await;
    }

    let (parent, dir_name) = split_parent(&canon);
    let dent = DirEntry {
        name: dir_name,
        id: new_dir_id,
        mode: MODE_DIR,
        mtime: now(),
        size: 0,
        modifier: user.to_string(),
    };
    let new_root = tree::put_file(
        &mgr.fs,
        &repo.store_id,
        &head_commit.root_id,
        &parent,
        &dent,
    )
    .await?;

    let mut desc = gen_commit_desc(mgr, &repo.store_id, &new_root, &head_commit.root_id).await;
    if desc.is_empty() {
        desc = "Auto merge by system".to_string();
    }
    gen_new_commit(mgr, &repo, &head_commit, new_root, user, &desc).await
}

/// Rename a library: a commit that keeps the parent root but changes the
/// repo name, retried while the head moves underneath.
pub async fn rename_repo(
    mgr: &RepoManager,
    repo_id: &str,
    new_name: &str,
    user: Option<&str>,
) -> RepoResult<()> {
    loop {
        let repo = mgr.get(repo_id).await?;
        let parent = mgr.commits.load(&repo.id, &repo.head_commit_id).await?;
        let user = user.unwrap_or(&parent.creator_name);

        let mut commit = new_commit(
            &repo,
            Some(parent.commit_id),
            parent.root_id,
            user,
            "Changed library name",
        );
        commit.repo_name = new_name.to_string();
        mgr.commits.save(&commit).await?;

        match mgr
            .metadata
            .update_branch_cas(
                &repo.id,
                "master",
                &commit.commit_id.to_hex(),
                &parent.commit_id.to_hex(),
            )
            .await
        {
            Ok(()) => {
                mgr.metadata
                    .update_repo_name_desc(&repo.id, new_name, &repo.desc)
                    .await?;
                update_repo_info(mgr, &repo.id, &commit).await?;
                return Ok(());
            }
            Err(reef_metadata::MetadataError::StaleHead { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Materialize the missing ancestors of `/parent_dir/relative_path`.
///
/// Walks up from the deepest segment until an existing ancestor is found,
/// then posts one placeholder directory entry per missing level and
/// commits the lot as `Added directory "<relative_path>"`. Returns true
/// if a commit was made.
pub async fn mkdir_with_parents(
    mgr: &RepoManager,
    repo_id: &str,
    parent_dir: &str,
    relative_path: &str,
    user: &str,
) -> RepoResult<bool> {
    let repo = mgr.get(repo_id).await?;
    let head_commit = mgr.commits.load(&repo.id, &repo.head_commit_id).await?;

    let relative_canon = canon_path(relative_path);
    let segments: Vec<&str> = relative_canon.split('/').filter(|s| !s.is_empty()).collect();
    for seg in &segments {
        if !reef_core::path::is_valid_filename(seg) {
            return Err(RepoError::BadPath(format!("invalid dir name {seg}")));
        }
    }

    // Find the deepest existing ancestor.
    let parent_canon = canon_path(parent_dir);
    let mut existing = parent_canon.clone();
    let mut missing: Vec<&str> = Vec::new();
    for i in (0..segments.len()).rev() {
        let candidate = reef_core::path::join_paths(
            &parent_canon,
            &segments[..=i].join("/"),
        );
        match mgr
            .fs
            .get_dirent_by_path(&repo.store_id, &head_commit.root_id, &candidate)
            .await
        {
            Ok(Some(_)) => {
                existing = candidate;
                break;
            }
            _ => missing.insert(0, segments[i]),
        }
    }

    if missing.is_empty() {
        return Ok(false);
    }

    let mut root = head_commit.root_id;
    let mut at = existing;
    for name in missing {
        let dent = DirEntry {
            name: name.to_string(),
            id: ZERO_OBJ_ID,
            mode: MODE_DIR,
            mtime: now(),
            size: 0,
            modifier: user.to_string(),
        };
        let (new_root, _) =
            tree::post_file(&mgr.fs, &repo.store_id, &root, &at, &dent, false, user).await?;
        root = new_root;
        at = reef_core::path::join_paths(&at, name);
    }

    let desc = format!("Added directory \"{relative_canon}\"");
    gen_new_commit(mgr, &repo, &head_commit, root, user, &desc).await?;
    Ok(true)
}
