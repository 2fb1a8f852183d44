//! Relational metadata store for the reef file-sync server.
//!
//! Holds the mutable side of the data model: branch pointers (with the
//! compare-and-swap advancement rule), the repo registry, cached repo
//! size/file-count statistics, and virtual-repo anchors. All immutable
//! state lives in the object store.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{BranchRepo, RegistryRepo, SizeRepo, VirtualRepoRepo};
pub use store::{MetadataStore, SqliteStore};
