//! Single-file, ranged and raw-block downloads.

use crate::access::{parse_crypt_key, parse_webaccess_info};
use crate::error::{ApiError, ApiResult};
use crate::headers::{set_cache_headers, set_common_headers};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use reef_core::{CryptKey, ObjectId};
use reef_repo::Repo;

/// GET/HEAD `/files/{token}/{filename}` - download or view one file.
pub async fn access_file(
    State(state): State<AppState>,
    Path((token, file_name)): Path<(String, String)>,
    method: Method,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    let info = parse_webaccess_info(&state, &token).await?;
    if !matches!(info.op.as_str(), "view" | "download" | "download-link") {
        return Err(ApiError::BadRequest("Bad access token".to_string()));
    }

    if request_headers.contains_key(header::IF_MODIFIED_SINCE) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let repo = state
        .mgr
        .get(&info.repo_id)
        .await
        .map_err(|_| ApiError::BadRequest("Bad repo id".to_string()))?;

    let crypt_key = if repo.is_encrypted {
        Some(parse_crypt_key(&state, &info.repo_id, &info.username).await?)
    } else {
        None
    };

    let file_id = ObjectId::from_hex(&info.obj_id)
        .map_err(|_| ApiError::BadRequest("Invalid file id".to_string()))?;
    if !state.mgr.fs.exists(&repo.store_id, &file_id).await? {
        return Err(ApiError::BadRequest("Invalid file id".to_string()));
    }

    let user_agent = request_headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let byte_ranges = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match byte_ranges {
        Some(ranges) if !repo.is_encrypted => {
            do_file_range(&state, &repo, &file_id, &file_name, &info.op, ranges, user_agent).await
        }
        _ => {
            do_file(
                &state, &repo, &file_id, &file_name, &info.op, crypt_key, user_agent, &method,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_file(
    state: &AppState,
    repo: &Repo,
    file_id: &ObjectId,
    file_name: &str,
    operation: &str,
    crypt_key: Option<CryptKey>,
    user_agent: Option<&str>,
    method: &Method,
) -> ApiResult<Response> {
    let file = state
        .mgr
        .fs
        .get_file(&repo.store_id, file_id)
        .await
        .map_err(|_| ApiError::BadRequest("Failed to get file object".to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    set_cache_headers(&mut headers);
    set_common_headers(
        &mut headers,
        operation,
        file_name,
        user_agent,
        &state.config.text_charset,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.file_size));

    if method == Method::HEAD || file.file_size == 0 {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let blocks = state.mgr.blocks.clone();
    let store_id = repo.store_id.clone();
    let body = Body::from_stream(futures::stream::iter(file.block_ids).then(move |id| {
        let blocks = blocks.clone();
        let store_id = store_id.clone();
        let crypt_key = crypt_key.clone();
        async move {
            let data = blocks.read(&store_id, &id).await?;
            match &crypt_key {
                Some(key) => key
                    .decrypt(&data)
                    .map(bytes::Bytes::from)
                    .map_err(reef_repo::RepoError::from),
                None => Ok(data),
            }
        }
    }));

    Ok((StatusCode::OK, headers, body).into_response())
}

async fn do_file_range(
    state: &AppState,
    repo: &Repo,
    file_id: &ObjectId,
    file_name: &str,
    operation: &str,
    byte_ranges: &str,
    user_agent: Option<&str>,
) -> ApiResult<Response> {
    let file = state
        .mgr
        .fs
        .get_file(&repo.store_id, file_id)
        .await
        .map_err(|_| ApiError::BadRequest("Failed to get file object".to_string()))?;

    if file.file_size == 0 {
        return Ok(StatusCode::OK.into_response());
    }

    let (start, end) = parse_range(byte_ranges, file.file_size)
        .ok_or(ApiError::RangeNotSatisfiable { file_size: file.file_size })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    set_cache_headers(&mut headers);
    set_common_headers(
        &mut headers,
        operation,
        file_name,
        user_agent,
        &state.config.text_charset,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start + 1));
    headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{}", file.file_size))
            .map_err(ApiError::internal)?,
    );

    // Resolve which slice of which block serves each piece of the range.
    let mut parts: Vec<(ObjectId, usize, usize)> = Vec::new();
    let mut offset: u64 = 0;
    let mut remaining = (end - start + 1) as usize;
    for id in &file.block_ids {
        let block_size = state.mgr.blocks.stat(&repo.store_id, id).await?;
        let block_end = offset + block_size;
        if block_end > start && remaining > 0 {
            let skip = start.saturating_sub(offset) as usize;
            let take = remaining.min((block_size as usize) - skip);
            parts.push((*id, skip, take));
            remaining -= take;
        }
        offset = block_end;
        if remaining == 0 {
            break;
        }
    }

    let blocks = state.mgr.blocks.clone();
    let store_id = repo.store_id.clone();
    let body = Body::from_stream(futures::stream::iter(parts).then(move |(id, skip, take)| {
        let blocks = blocks.clone();
        let store_id = store_id.clone();
        async move {
            let data = blocks.read(&store_id, &id).await?;
            Ok::<_, reef_repo::RepoError>(data.slice(skip..skip + take))
        }
    }));

    Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
}

/// Parse a `Range: bytes=` header against a file size.
///
/// Supported forms: `bytes=A-B` (B clamped to the last byte), `bytes=A-`
/// and `bytes=-N` (final N bytes). Returns None when malformed, when
/// `A > B`, or when a suffix length is zero or exceeds the file.
fn parse_range(byte_ranges: &str, file_size: u64) -> Option<(u64, u64)> {
    let spec = byte_ranges.strip_prefix("bytes=")?;
    let dash = spec.find('-')?;
    let (first, last) = (&spec[..dash], &spec[dash + 1..]);

    let (start, end) = if first.is_empty() {
        let suffix: u64 = last.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        (file_size.checked_sub(suffix)?, file_size - 1)
    } else if last.is_empty() {
        (first.parse().ok()?, file_size - 1)
    } else {
        let start: u64 = first.parse().ok()?;
        let end: u64 = last.parse().ok()?;
        (start, end.min(file_size - 1))
    };

    if start > end {
        return None;
    }
    Some((start, end))
}

/// GET `/blks/{token}/{block_id}` - raw block download.
///
/// The block must be referenced by the file object the token names, and
/// must exist; encrypted repos serve ciphertext.
pub async fn access_blks(
    State(state): State<AppState>,
    Path((token, block_id)): Path<(String, String)>,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    let info = parse_webaccess_info(&state, &token).await?;

    if request_headers.contains_key(header::IF_MODIFIED_SINCE) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let repo = state
        .mgr
        .get(&info.repo_id)
        .await
        .map_err(|_| ApiError::BadRequest("Bad repo id".to_string()))?;

    let file_id = ObjectId::from_hex(&info.obj_id)
        .map_err(|_| ApiError::BadRequest("Invalid file id".to_string()))?;
    if !state.mgr.fs.exists(&repo.store_id, &file_id).await? {
        return Err(ApiError::BadRequest("Invalid file id".to_string()));
    }

    if info.op != "downloadblks" {
        return Err(ApiError::BadRequest("Bad access token".to_string()));
    }

    let block_id = ObjectId::from_hex(&block_id)
        .map_err(|_| ApiError::BadRequest("Invalid block id".to_string()))?;
    let file = state
        .mgr
        .fs
        .get_file(&repo.store_id, &file_id)
        .await
        .map_err(|_| ApiError::BadRequest("Failed to get file object".to_string()))?;
    if !file.block_ids.contains(&block_id) {
        return Err(ApiError::BadRequest(String::new()));
    }
    if !state.mgr.blocks.exists(&repo.store_id, &block_id).await? {
        return Err(ApiError::BadRequest(String::new()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    set_cache_headers(&mut headers);
    set_common_headers(
        &mut headers,
        "downloadblks",
        &block_id.to_hex(),
        request_headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok()),
        &state.config.text_charset,
    );

    let size = state.mgr.blocks.stat(&repo.store_id, &block_id).await?;
    if size == 0 {
        return Ok((StatusCode::OK, headers).into_response());
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));

    let stream = state.mgr.blocks.read_stream(&repo.store_id, &block_id).await?;
    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

#[cfg(test)]
mod tests {
    use super::parse_range;

    #[test]
    fn closed_ranges() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-2000", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=5-2", 1000), None);
    }

    #[test]
    fn open_and_suffix_ranges() {
        assert_eq!(parse_range("bytes=200-", 1000), Some((200, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("bytes=-2000", 1000), None);
    }

    #[test]
    fn malformed_ranges() {
        assert_eq!(parse_range("bytes=abc", 1000), None);
        assert_eq!(parse_range("items=0-5", 1000), None);
        assert_eq!(parse_range("bytes=a-b", 1000), None);
    }
}
