//! Zip streaming of directories and multi-file selections.
//!
//! The archive is produced on the fly from live object-store reads and
//! deflate-compressed straight into the response body; nothing is
//! buffered beyond one block.

use crate::access::parse_webaccess_info;
use crate::error::{ApiError, ApiResult};
use crate::headers::{set_cache_headers, set_common_headers};
use crate::state::AppState;
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipDateTimeBuilder, ZipEntryBuilder};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use futures::{AsyncWriteExt, FutureExt, StreamExt};
use reef_core::fs::DirEntry;
use reef_core::ObjectId;
use reef_repo::RepoManager;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

/// Zip token payload for a single directory.
#[derive(Debug, Deserialize)]
struct DirDownloadData {
    dir_name: String,
    obj_id: String,
}

/// Zip token payload for a multi-file selection.
#[derive(Debug, Deserialize)]
struct MultiDownloadData {
    parent_dir: String,
    file_list: Vec<String>,
}

/// GET `/zip/{token}` - stream a zip of a directory or a selection.
pub async fn access_zip(
    State(state): State<AppState>,
    Path(token): Path<String>,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    let info = parse_webaccess_info(&state, &token).await?;
    if !matches!(
        info.op.as_str(),
        "download-dir" | "download-dir-link" | "download-multi" | "download-multi-link"
    ) {
        return Err(ApiError::BadRequest("Bad access token".to_string()));
    }

    if request_headers.contains_key(header::IF_MODIFIED_SINCE) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let repo = state
        .mgr
        .get(&info.repo_id)
        .await
        .map_err(|_| ApiError::BadRequest("Failed to get repo".to_string()))?;

    let user_agent = request_headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    set_cache_headers(&mut headers);

    // Resolve what to pack before the response starts streaming, so
    // malformed payloads still fail with a proper status.
    let mut items: Vec<DirEntry> = Vec::new();
    if matches!(info.op.as_str(), "download-dir" | "download-dir-link") {
        let data: DirDownloadData = serde_json::from_str(&info.obj_id)
            .map_err(|e| ApiError::internal(format!("invalid zip token payload: {e}")))?;
        let dir_id = ObjectId::from_hex(&data.obj_id)
            .map_err(|_| ApiError::BadRequest("Invalid dir id".to_string()))?;
        set_common_headers(
            &mut headers,
            "download",
            &data.dir_name,
            user_agent,
            &state.config.text_charset,
        );
        items.push(DirEntry {
            name: data.dir_name,
            id: dir_id,
            mode: reef_core::MODE_DIR,
            mtime: 0,
            size: 0,
            modifier: String::new(),
        });
    } else {
        let data: MultiDownloadData = serde_json::from_str(&info.obj_id)
            .map_err(|e| ApiError::internal(format!("invalid zip token payload: {e}")))?;
        let dir = state
            .mgr
            .fs
            .get_dir_by_path(&repo.store_id, &repo.root_id, &data.parent_dir)
            .await
            .map_err(|_| ApiError::NotFound(format!("dir {}", data.parent_dir)))?;
        for name in &data.file_list {
            let entry = dir
                .get(name)
                .ok_or_else(|| ApiError::BadRequest(format!("no such file {name}")))?;
            items.push(entry.clone());
        }

        let now = time::OffsetDateTime::now_utc();
        let zip_name = format!(
            "documents-export-{}-{}-{}.zip",
            now.year(),
            now.month() as u8,
            now.day()
        );
        set_common_headers(
            &mut headers,
            "download",
            &zip_name,
            user_agent,
            &state.config.text_charset,
        );
    }

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let mgr = state.mgr.clone();
    let store_id = repo.store_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pack_zip(mgr, store_id, items, writer).await {
            // The client sees a truncated archive; nothing to send anymore.
            tracing::warn!(error = %e, "zip streaming aborted");
        }
    });

    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

async fn pack_zip(
    mgr: Arc<RepoManager>,
    store_id: String,
    items: Vec<DirEntry>,
    writer: DuplexStream,
) -> ApiResult<()> {
    let mut zip = ZipFileWriter::with_tokio(writer);
    for item in items {
        if item.is_dir() {
            pack_dir(&mgr, &store_id, &mut zip, item.id, item.name.clone()).await?;
        } else {
            pack_file(&mgr, &store_id, &mut zip, &item, "").await?;
        }
    }
    zip.close().await.map_err(ApiError::internal)?;
    Ok(())
}

/// Recursively append a directory to the archive.
fn pack_dir<'a>(
    mgr: &'a RepoManager,
    store_id: &'a str,
    zip: &'a mut ZipFileWriter<DuplexStream>,
    dir_id: ObjectId,
    dir_path: String,
) -> BoxFuture<'a, ApiResult<()>> {
    async move {
        let dir = mgr.fs.get_dir(store_id, &dir_id).await?;

        if dir.entries.is_empty() {
            let name = format!("{}/", dir_path.trim_start_matches('/'));
            let builder = ZipEntryBuilder::new(name.into(), Compression::Stored);
            zip.write_entry_whole(builder, &[])
                .await
                .map_err(ApiError::internal)?;
            return Ok(());
        }

        for entry in &dir.entries {
            let child_path = format!("{dir_path}/{}", entry.name);
            if entry.is_dir() {
                pack_dir(mgr, store_id, zip, entry.id, child_path).await?;
            } else {
                pack_file(mgr, store_id, zip, entry, &dir_path).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

/// Append one file to the archive, block by block.
async fn pack_file(
    mgr: &RepoManager,
    store_id: &str,
    zip: &mut ZipFileWriter<DuplexStream>,
    dirent: &DirEntry,
    parent_path: &str,
) -> ApiResult<()> {
    let file = mgr.fs.get_file(store_id, &dirent.id).await?;

    let file_path = if parent_path.is_empty() {
        dirent.name.clone()
    } else {
        format!("{}/{}", parent_path.trim_start_matches('/'), dirent.name)
    };
    let file_path = file_path.trim_start_matches('/').to_string();

    let builder = ZipEntryBuilder::new(file_path.into(), Compression::Deflate)
        .last_modification_date(zip_date(dirent.mtime));
    let mut entry = zip
        .write_entry_stream(builder)
        .await
        .map_err(ApiError::internal)?;

    for block_id in &file.block_ids {
        let mut stream = mgr.blocks.read_stream(store_id, block_id).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ApiError::internal)?;
            entry.write_all(&chunk).await.map_err(ApiError::internal)?;
        }
    }
    entry.close().await.map_err(ApiError::internal)?;
    Ok(())
}

fn zip_date(mtime: i64) -> async_zip::ZipDateTime {
    let dt = time::OffsetDateTime::from_unix_timestamp(mtime)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    ZipDateTimeBuilder::new()
        .year(dt.year())
        .month(dt.month() as u32)
        .day(dt.day() as u32)
        .hour(dt.hour() as u32)
        .minute(dt.minute() as u32)
        .second(dt.second() as u32)
        .build()
}
