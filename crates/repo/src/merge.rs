//! Three-way tree merge.
//!
//! Merges `(base, head, remote)` roots entry by entry: an entry changed
//! on only one side wins, identical changes collapse, and diverging
//! directories recurse. Diverging files conflict: the head version keeps
//! its name and the remote version is preserved under a conflict name, so
//! no committed data is ever dropped by a merge.

use crate::error::RepoResult;
use crate::registry::now;
use crate::store::FsStore;
use crate::tree::gen_unique_name;
use futures::future::BoxFuture;
use futures::FutureExt;
use reef_core::fs::{DirEntry, Directory};
use reef_core::ObjectId;
use std::collections::BTreeSet;

/// Outcome of a tree merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeResult {
    pub root: ObjectId,
    pub conflict: bool,
}

/// Merge three roots, persisting any newly created directories.
///
/// `user` labels conflict copies.
pub async fn merge_trees(
    fs: &FsStore,
    store_id: &str,
    base: &ObjectId,
    head: &ObjectId,
    remote: &ObjectId,
    user: &str,
) -> RepoResult<MergeResult> {
    let mut conflict = false;
    let root = merge_dirs(
        fs,
        store_id,
        Some(*base),
        Some(*head),
        Some(*remote),
        user,
        &mut conflict,
    )
    .await?;
    Ok(MergeResult { root, conflict })
}

fn same(a: Option<&DirEntry>, b: Option<&DirEntry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.id == b.id && a.is_dir() == b.is_dir(),
        _ => false,
    }
}

fn merge_dirs<'a>(
    fs: &'a FsStore,
    store_id: &'a str,
    base_id: Option<ObjectId>,
    head_id: Option<ObjectId>,
    remote_id: Option<ObjectId>,
    user: &'a str,
    conflict: &'a mut bool,
) -> BoxFuture<'a, RepoResult<ObjectId>> {
    async move {
        let load = |id: Option<ObjectId>| async move {
            match id {
                Some(id) => fs.get_dir(store_id, &id).await,
                None => Ok(Directory::empty()),
            }
        };
        let base = load(base_id).await?;
        let head = load(head_id).await?;
        let remote = load(remote_id).await?;

        let names: BTreeSet<&str> = head
            .entries
            .iter()
            .chain(remote.entries.iter())
            .chain(base.entries.iter())
            .map(|e| e.name.as_str())
            .collect();

        let mut merged: Vec<DirEntry> = Vec::new();
        let mut conflicted: Vec<DirEntry> = Vec::new();
        for name in names {
            let b = base.get(name);
            let h = head.get(name);
            let r = remote.get(name);

            if same(h, r) {
                if let Some(h) = h {
                    merged.push(h.clone());
                }
            } else if same(b, h) {
                if let Some(r) = r {
                    merged.push(r.clone());
                }
            } else if same(b, r) {
                if let Some(h) = h {
                    merged.push(h.clone());
                }
            } else {
                match (h, r) {
                    (Some(h), Some(r)) if h.is_dir() && r.is_dir() => {
                        let sub_base = b.filter(|e| e.is_dir()).map(|e| e.id);
                        let sub = merge_dirs(
                            fs,
                            store_id,
                            sub_base,
                            Some(h.id),
                            Some(r.id),
                            user,
                            conflict,
                        )
                        .await?;
                        let mut entry = h.clone();
                        entry.id = sub;
                        entry.mtime = now();
                        merged.push(entry);
                    }
                    (Some(h), Some(r)) => {
                        *conflict = true;
                        merged.push(h.clone());
                        conflicted.push(r.clone());
                    }
                    // One side modified, the other deleted: keep the
                    // surviving version and flag the conflict.
                    (Some(e), None) | (None, Some(e)) => {
                        *conflict = true;
                        merged.push(e.clone());
                    }
                    (None, None) => unreachable!("name came from one of the three trees"),
                }
            }
        }

        for entry in conflicted {
            let conflict_name = format!("{} (SFConflict {})", entry.name, user);
            if let Some(unique) = gen_unique_name(&conflict_name, &merged) {
                let mut copy = entry;
                copy.name = unique;
                copy.mtime = now();
                merged.push(copy);
            }
        }

        fs.save_dir(store_id, &Directory::new(merged)).await
    }
    .boxed()
}
