//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bind address (e.g., "0.0.0.0:8082").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Root data directory. Upload temp files live under
    /// `<data_dir>/httptemp` and `<data_dir>/httptemp/cluster-shared`.
    pub data_dir: PathBuf,
    /// Path of the SQLite metadata database.
    pub db_path: PathBuf,
    /// Base URL of the RPC gateway resolving tokens, keys and quota.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Maximum accepted upload size in bytes. Absent means unlimited.
    #[serde(default)]
    pub max_upload_size: Option<u64>,
    /// Cluster/cloud deployment mode; affects virtual-repo teardown.
    #[serde(default)]
    pub cloud_mode: bool,
    /// Charset suffix appended to text content types.
    #[serde(default = "default_text_charset")]
    pub text_charset: String,
    /// Number of background size-recompute workers.
    #[serde(default = "default_size_workers")]
    pub size_workers: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8083/rpc".to_string()
}

fn default_text_charset() -> String {
    "gbk".to_string()
}

fn default_size_workers() -> usize {
    2
}

impl AppConfig {
    /// Temp directory for non-resumable upload spooling.
    pub fn http_temp_dir(&self) -> PathBuf {
        self.data_dir.join("httptemp")
    }

    /// Cluster-shared temp directory for resumable chunked uploads.
    pub fn cluster_shared_temp_dir(&self) -> PathBuf {
        self.http_temp_dir().join("cluster-shared")
    }

    /// Create a test configuration rooted at a scratch directory.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            bind: default_bind(),
            data_dir: root.join("data"),
            db_path: root.join("metadata.db"),
            rpc_url: default_rpc_url(),
            max_upload_size: None,
            cloud_mode: false,
            text_charset: default_text_charset(),
            size_workers: 1,
        }
    }
}
