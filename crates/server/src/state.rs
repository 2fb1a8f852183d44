//! Application state shared across handlers.

use crate::oracle::RpcOracle;
use reef_core::AppConfig;
use reef_repo::{RepoManager, SizeScheduler};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Stores, registry and commit machinery.
    pub mgr: Arc<RepoManager>,
    /// External RPC oracle client.
    pub oracle: Arc<dyn RpcOracle>,
    /// Background size-recompute queue.
    pub sizes: SizeScheduler,
}

impl AppState {
    /// Create a new application state and spawn the size workers.
    ///
    /// Also makes sure the upload temp directories exist so the first
    /// request does not have to.
    pub fn new(config: AppConfig, mgr: Arc<RepoManager>, oracle: Arc<dyn RpcOracle>) -> Self {
        std::fs::create_dir_all(config.cluster_shared_temp_dir()).ok();

        let sizes = SizeScheduler::new(mgr.clone(), config.size_workers);
        Self {
            config: Arc::new(config),
            mgr,
            oracle,
            sizes,
        }
    }
}
