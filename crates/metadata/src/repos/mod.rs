//! Per-table repository traits.

pub mod branches;
pub mod registry;
pub mod sizes;
pub mod virtual_repos;

pub use branches::BranchRepo;
pub use registry::RegistryRepo;
pub use sizes::SizeRepo;
pub use virtual_repos::VirtualRepoRepo;
