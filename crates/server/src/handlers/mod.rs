//! HTTP handlers.

pub mod files;
pub mod upload;
pub mod zip;

pub use files::{access_blks, access_file};
pub use upload::{upload_ajax, upload_api};
pub use zip::access_zip;
