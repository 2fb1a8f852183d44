//! Pure tree mutators.
//!
//! Every mutation rewrites the directories on the path from the root to
//! the touched directory and nothing else; sibling subtrees survive by
//! reference. All functions return the new root id without touching any
//! mutable state — committing the result is the caller's concern.

use crate::error::{RepoError, RepoResult};
use crate::registry::now;
use crate::store::FsStore;
use reef_core::fs::{DirEntry, Directory};
use reef_core::path::canon_path;
use reef_core::ObjectId;

/// A loaded root-to-parent directory chain for one path.
struct PathChain {
    /// `dirs[0]` is the root; `dirs[i + 1]` is reached via `segs[i]`.
    dirs: Vec<Directory>,
    segs: Vec<String>,
}

async fn load_chain(
    fs: &FsStore,
    store_id: &str,
    root: &ObjectId,
    path: &str,
) -> RepoResult<PathChain> {
    let canon = canon_path(path);
    let mut dirs = vec![fs.get_dir(store_id, root).await?];
    let mut segs = Vec::new();
    for seg in canon.split('/').filter(|s| !s.is_empty()) {
        let current = dirs.last().unwrap();
        let entry = current
            .get(seg)
            .filter(|e| e.is_dir())
            .ok_or_else(|| RepoError::NotFound(format!("dir {seg} in path {canon}")))?
            .clone();
        dirs.push(fs.get_dir(store_id, &entry.id).await?);
        segs.push(seg.to_string());
    }
    Ok(PathChain { dirs, segs })
}

/// Persist a mutated leaf and rewrite every ancestor on the chain.
async fn rebuild_chain(
    fs: &FsStore,
    store_id: &str,
    chain: &PathChain,
    leaf: Directory,
) -> RepoResult<ObjectId> {
    let mut child_id = fs.save_dir(store_id, &leaf).await?;
    for i in (0..chain.segs.len()).rev() {
        let mut dir = chain.dirs[i].clone();
        let seg = &chain.segs[i];
        let entry = dir
            .entries
            .iter_mut()
            .find(|e| e.name == *seg)
            .ok_or_else(|| RepoError::NotFound(format!("dir {seg}")))?;
        entry.id = child_id;
        entry.mtime = now();
        child_id = fs.save_dir(store_id, &dir).await?;
    }
    Ok(child_id)
}

/// Replace the entry named `dent.name` in the directory at `parent_dir`.
///
/// The name must already exist; this is the "directory pointer update"
/// primitive used by the virtual-repo synchronizer and replace-mode
/// uploads.
pub async fn put_file(
    fs: &FsStore,
    store_id: &str,
    root: &ObjectId,
    parent_dir: &str,
    dent: &DirEntry,
) -> RepoResult<ObjectId> {
    let chain = load_chain(fs, store_id, root, parent_dir).await?;
    let old_leaf = chain.dirs.last().unwrap();
    if old_leaf.get(&dent.name).is_none() {
        return Err(RepoError::NotFound(format!("file {}", dent.name)));
    }
    let entries = old_leaf
        .entries
        .iter()
        .map(|e| {
            if e.name == dent.name {
                dent.clone()
            } else {
                e.clone()
            }
        })
        .collect();
    rebuild_chain(fs, store_id, &chain, Directory::new(entries)).await
}

/// Append a batch of entries to the directory at `parent_dir`.
///
/// With `replace` set, a same-named entry is overwritten in place;
/// otherwise the name is disambiguated through [`gen_unique_name`]. The
/// final names land in `names_out` in input order.
pub async fn post_multi_files(
    fs: &FsStore,
    store_id: &str,
    root: &ObjectId,
    parent_dir: &str,
    dents: &[DirEntry],
    replace: bool,
    user: &str,
    names_out: &mut Vec<String>,
) -> RepoResult<ObjectId> {
    let chain = load_chain(fs, store_id, root, parent_dir).await?;
    let mut entries = chain.dirs.last().unwrap().entries.clone();
    add_new_entries(&mut entries, dents, replace, user, names_out)?;
    rebuild_chain(fs, store_id, &chain, Directory::new(entries)).await
}

/// Append a single entry, returning the new root and the stored name.
pub async fn post_file(
    fs: &FsStore,
    store_id: &str,
    root: &ObjectId,
    parent_dir: &str,
    dent: &DirEntry,
    replace: bool,
    user: &str,
) -> RepoResult<(ObjectId, String)> {
    let mut names = Vec::new();
    let new_root = post_multi_files(
        fs,
        store_id,
        root,
        parent_dir,
        std::slice::from_ref(dent),
        replace,
        user,
        &mut names,
    )
    .await?;
    Ok((new_root, names.remove(0)))
}

fn add_new_entries(
    entries: &mut Vec<DirEntry>,
    dents: &[DirEntry],
    replace: bool,
    user: &str,
    names_out: &mut Vec<String>,
) -> RepoResult<()> {
    for dent in dents {
        if replace {
            if let Some(pos) = entries.iter().position(|e| e.name == dent.name) {
                let mut new_dent = dent.clone();
                new_dent.modifier = user.to_string();
                entries[pos] = new_dent;
                names_out.push(dent.name.clone());
                continue;
            }
        }

        let unique = gen_unique_name(&dent.name, entries)
            .ok_or_else(|| RepoError::UniqueName(dent.name.clone()))?;
        let mut new_dent = dent.clone();
        new_dent.name = unique.clone();
        new_dent.modifier = user.to_string();
        entries.push(new_dent);
        names_out.push(unique);
    }
    Ok(())
}

/// Disambiguate `file_name` against `entries`.
///
/// The name splits into stem and extension at the *first* dot; collisions
/// try `stem (i)[.ext]` for `i` in 1..=100 before giving up.
pub fn gen_unique_name(file_name: &str, entries: &[DirEntry]) -> Option<String> {
    if !name_exists(entries, file_name) {
        return Some(file_name.to_string());
    }
    let (stem, ext) = match file_name.find('.') {
        Some(dot) => (&file_name[..dot], Some(&file_name[dot + 1..])),
        None => (file_name, None),
    };
    for i in 1..=100 {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        if !name_exists(entries, &candidate) {
            return Some(candidate);
        }
    }
    None
}

fn name_exists(entries: &[DirEntry], name: &str) -> bool {
    entries.iter().any(|e| e.name == name)
}
