//! Commit engine and tree machinery for the reef file-sync server.
//!
//! Everything between the HTTP handlers and the raw stores lives here:
//! typed block/fs/commit stores over [`reef_storage::ObjectStore`], the
//! repo registry, the pure tree mutators, the three-way merging commit
//! engine with its branch CAS retry loop, tree diffing with directory
//! rename detection, virtual-repo synchronization, the background size
//! worker, and the block-indexing pipeline used by uploads.

pub mod commit;
pub mod diff;
pub mod error;
pub mod index;
pub mod merge;
pub mod registry;
pub mod size;
pub mod store;
pub mod tree;
pub mod virtualrepo;

pub use commit::gen_new_commit;
pub use error::{RepoError, RepoResult};
pub use registry::{Repo, RepoManager};
pub use size::SizeScheduler;
pub use store::{BlockStore, CommitStore, FsStore};
