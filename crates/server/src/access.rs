//! Access token resolution.

use crate::error::{ApiError, ApiResult};
use crate::oracle::WebAccessInfo;
use crate::state::AppState;

/// Ops a token may carry.
const KNOWN_OPS: &[&str] = &[
    "view",
    "download",
    "download-link",
    "download-dir",
    "download-dir-link",
    "download-multi",
    "download-multi-link",
    "downloadblks",
    "upload",
    "upload-link",
];

/// Resolve a token through the oracle and validate its shape.
pub async fn parse_webaccess_info(state: &AppState, token: &str) -> ApiResult<WebAccessInfo> {
    let info = state
        .oracle
        .query_access_token(token)
        .await?
        .ok_or_else(|| ApiError::BadRequest("Bad access token".to_string()))?;

    if info.repo_id.is_empty() || info.op.is_empty() || info.username.is_empty() {
        return Err(ApiError::BadRequest("Bad access token".to_string()));
    }
    if !KNOWN_OPS.contains(&info.op.as_str()) {
        return Err(ApiError::BadRequest("Bad access token".to_string()));
    }
    Ok(info)
}

/// Fetch and decode the decryption key for an encrypted repo.
pub async fn parse_crypt_key(
    state: &AppState,
    repo_id: &str,
    user: &str,
) -> ApiResult<reef_core::CryptKey> {
    let key = state
        .oracle
        .get_decrypt_key(repo_id, user)
        .await?
        .ok_or_else(|| {
            ApiError::BadRequest(
                "Repo is encrypted. Please provide password to view it.".to_string(),
            )
        })?;
    reef_core::CryptKey::from_hex(&key.key, &key.iv).map_err(ApiError::internal)
}

/// Check an upload URL's operation segment against the token's op.
///
/// `upload-link` tokens are normalized to `upload`; the URL segment
/// (`upload-api`, `upload-aj`) must start with the op.
pub fn check_upload_url_op(url_op: &str, token_op: &str) -> ApiResult<()> {
    let op = if token_op == "upload-link" {
        "upload"
    } else {
        token_op
    };
    if !url_op.starts_with(op) {
        return Err(ApiError::Forbidden("Access denied".to_string()));
    }
    Ok(())
}
