//! File, directory and commit objects and their canonical codec.
//!
//! Objects are serialized as JSON with a fixed field order (serde emits
//! struct fields in declaration order) and no extra whitespace; the object
//! id is the SHA-1 of exactly those bytes. Any reordering or formatting
//! change would silently fork the id space, so the field order below is
//! part of the wire contract.

use crate::hash::ObjectId;
use serde::{Deserialize, Serialize};

/// A file object: an ordered list of block ids plus the total size.
///
/// The file's bytes are the concatenation of its blocks in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    pub version: u32,
    pub file_size: u64,
    pub block_ids: Vec<ObjectId>,
}

impl FileObject {
    pub fn new(version: u32, file_size: u64, block_ids: Vec<ObjectId>) -> Self {
        Self {
            version,
            file_size,
            block_ids,
        }
    }

    /// Serialize to the canonical byte form and derive the object id.
    pub fn encode(&self) -> crate::Result<(ObjectId, Vec<u8>)> {
        let bytes = serde_json::to_vec(self)?;
        Ok((ObjectId::compute(&bytes), bytes))
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One entry of a directory object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: ObjectId,
    pub mode: u32,
    pub mtime: i64,
    pub size: i64,
    #[serde(default)]
    pub modifier: String,
}

impl DirEntry {
    /// Whether this entry points at a directory object.
    pub fn is_dir(&self) -> bool {
        crate::is_dir_mode(self.mode)
    }
}

/// A directory object: a name-unique, lexicographically sorted entry list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub version: u32,
    pub entries: Vec<DirEntry>,
}

impl Directory {
    /// Create a directory, sorting the entries into canonical order.
    pub fn new(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            version: crate::DIR_VERSION,
            entries,
        }
    }

    /// An empty directory.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Serialize the sorted-entry form and derive the object id.
    ///
    /// Entries are re-sorted defensively so that a caller who pushed
    /// entries out of order still produces the canonical id.
    pub fn encode(&self) -> crate::Result<(ObjectId, Vec<u8>)> {
        let mut sorted = self.clone();
        sorted.entries.sort_by(|a, b| a.name.cmp(&b.name));
        let bytes = serde_json::to_vec(&sorted)?;
        Ok((ObjectId::compute(&bytes), bytes))
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A commit: an immutable snapshot of a repo root with its ancestry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_id: ObjectId,
    pub repo_id: String,
    pub root_id: ObjectId,
    pub parent_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_parent_id: Option<ObjectId>,
    pub creator_id: String,
    pub creator_name: String,
    pub desc: String,
    pub ctime: i64,
    pub repo_name: String,
    pub repo_desc: String,
    pub encrypted: bool,
    #[serde(default)]
    pub enc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub version: u32,
    #[serde(default)]
    pub new_merge: bool,
    #[serde(default)]
    pub conflict: bool,
}

impl Commit {
    /// Compute the commit id.
    ///
    /// The id is the SHA-1 of `root_id ‖ creator_id ‖ creator_name ‖ desc
    /// ‖ big-endian-u64(ctime)` — exactly these fields, in this order,
    /// with no separators. `parent_id` is deliberately excluded.
    pub fn compute_id(&self) -> ObjectId {
        let mut hasher = ObjectId::hasher();
        hasher.update(self.root_id.to_hex().as_bytes());
        hasher.update(self.creator_id.as_bytes());
        hasher.update(self.creator_name.as_bytes());
        hasher.update(self.desc.as_bytes());
        hasher.update(&(self.ctime as u64).to_be_bytes());
        hasher.finalize()
    }

    /// Serialize to the canonical byte form.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
