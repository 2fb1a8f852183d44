//! HTTP data plane for the reef file-sync server.
//!
//! This crate provides the web surface:
//! - Single-file and byte-range downloads, decrypting on the fly
//! - Raw block downloads
//! - Zip streaming of directories and multi-file selections
//! - Multipart uploads, whole-file and resumable chunked
//! - Token resolution against the external access oracle

pub mod access;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod oracle;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use oracle::{DecryptKey, OracleError, RpcOracle, WebAccessInfo};
pub use routes::create_router;
pub use state::AppState;
