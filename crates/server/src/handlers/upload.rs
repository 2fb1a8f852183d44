//! Multipart upload ingest: whole-file and resumable chunked.

use crate::access::{check_upload_url_op, parse_crypt_key, parse_webaccess_info};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reef_core::path::{base_name, canon_path, is_valid_filename, join_paths};
use reef_core::fs::DirEntry;
use reef_core::{CryptKey, MODE_REG};
use reef_metadata::RegistryRepo;
use reef_repo::registry::{now, REPO_STATUS_NORMAL};
use reef_repo::{index, tree, virtualrepo, Repo};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Stats-bus channel for upload events.
const STATS_CHANNEL: &str = "reef_server.stats";

/// Per-request upload context resolved from the token and headers.
struct RecvData {
    /// parent_dir the token was issued for.
    token_parent_dir: String,
    /// The token's original op (`upload` or `upload-link`).
    token_type: String,
    repo_id: String,
    user: String,
    /// Content-Range fields; -1 when the request is not chunked.
    rstart: i64,
    rend: i64,
    fsize: i64,
}

/// POST `/upload-api/{token}` - multipart upload, API response format.
pub async fn upload_api(
    state: State<AppState>,
    path: Path<String>,
    query: Query<HashMap<String, String>>,
    request_headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    upload_common(state, path, query, request_headers, multipart, false, "upload-api").await
}

/// POST `/upload-aj/{token}` - multipart upload, AJAX response format.
pub async fn upload_ajax(
    state: State<AppState>,
    path: Path<String>,
    query: Query<HashMap<String, String>>,
    request_headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    upload_common(state, path, query, request_headers, multipart, true, "upload-aj").await
}

/// OPTIONS preflight for the upload endpoints.
pub async fn upload_options() -> Response {
    let mut response = StatusCode::OK.into_response();
    set_cors_headers(response.headers_mut());
    response
}

async fn upload_common(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request_headers: HeaderMap,
    multipart: Multipart,
    is_ajax: bool,
    url_op: &str,
) -> Response {
    let ret_json = is_ajax || query.contains_key("ret-json");
    let mut response =
        match do_upload(&state, &token, url_op, &request_headers, multipart, ret_json).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    set_cors_headers(response.headers_mut());
    response
}

fn set_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "x-requested-with, content-type, content-range, content-disposition, accept, origin, authorization",
        ),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
}

async fn parse_upload_headers(
    state: &AppState,
    token: &str,
    url_op: &str,
    request_headers: &HeaderMap,
) -> ApiResult<RecvData> {
    let info = parse_webaccess_info(state, token)
        .await
        .map_err(|_| ApiError::BadRequest("Access denied".to_string()))?;

    if let Some(repo) = state.mgr.metadata.get_repo(&info.repo_id).await? {
        if repo.status != REPO_STATUS_NORMAL {
            return Err(ApiError::BadRequest("Access denied".to_string()));
        }
    }

    check_upload_url_op(url_op, &info.op)?;

    let payload: serde_json::Value = serde_json::from_str(&info.obj_id)
        .map_err(|e| ApiError::BadRequest(format!("failed to decode obj data: {e}")))?;
    let token_parent_dir = payload
        .get("parent_dir")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid URL".to_string()))?
        .to_string();

    let mut data = RecvData {
        token_parent_dir,
        token_type: info.op.clone(),
        repo_id: info.repo_id,
        user: info.username,
        rstart: -1,
        rend: -1,
        fsize: -1,
    };

    if let Some(ranges) = request_headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some((start, end, size)) = parse_content_range(ranges) {
            data.rstart = start;
            data.rend = end;
            data.fsize = size;
        }
    }

    Ok(data)
}

/// Parse `Content-Range: bytes FIRST-LAST/TOTAL`. Returns None unless
/// `FIRST <= LAST < TOTAL`.
fn parse_content_range(ranges: &str) -> Option<(i64, i64, i64)> {
    let rest = ranges.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, size_part) = rest.split_once('/')?;
    let (first, last) = range_part.split_once('-')?;
    let first: i64 = first.trim().parse().ok()?;
    let last: i64 = last.trim().parse().ok()?;
    let size: i64 = size_part.trim().parse().ok()?;
    if first > last || last >= size {
        return None;
    }
    Some((first, last, size))
}

/// Parsed multipart form: scalar fields plus spooled file parts.
#[derive(Default)]
struct UploadForm {
    replace: Option<String>,
    parent_dir: Option<String>,
    relative_path: Option<String>,
    /// `(file name as sent, spool path)` in arrival order.
    files: Vec<(String, PathBuf)>,
}

async fn parse_multipart(state: &AppState, multipart: &mut Multipart) -> ApiResult<UploadForm> {
    let mut form = UploadForm::default();
    match fill_form(state, multipart, &mut form).await {
        Ok(()) => Ok(form),
        Err(e) => {
            // Anything already spooled is orphaned; clean it up.
            for (_, spool) in &form.files {
                tokio::fs::remove_file(spool).await.ok();
            }
            Err(e)
        }
    }
}

async fn fill_form(
    state: &AppState,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> ApiResult<()> {
    let spool_dir = state.config.http_temp_dir();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "replace" | "parent_dir" | "relative_path" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("bad multipart field: {e}")))?;
                let slot = match name.as_str() {
                    "replace" => &mut form.replace,
                    "parent_dir" => &mut form.parent_dir,
                    _ => &mut form.relative_path,
                };
                if slot.is_some() {
                    return Err(ApiError::BadRequest("wrong multipart form data".to_string()));
                }
                *slot = Some(text);
            }
            "file" => {
                let file_name = base_name(field.file_name().unwrap_or_default());
                let tmp = tempfile::Builder::new()
                    .prefix(&file_name)
                    .tempfile_in(&spool_dir)
                    .map_err(ApiError::internal)?;
                let (std_file, spool_path) = tmp.keep().map_err(ApiError::internal)?;
                // Record the spool before writing so a failed write still
                // gets cleaned up by the caller.
                form.files.push((file_name, spool_path.clone()));
                let mut file = tokio::fs::File::from_std(std_file);
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            file.write_all(&chunk).await.map_err(ApiError::internal)?
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return Err(ApiError::BadRequest(format!("bad multipart body: {e}")));
                        }
                    }
                }
                file.flush().await.map_err(ApiError::internal)?;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn do_upload(
    state: &AppState,
    token: &str,
    url_op: &str,
    request_headers: &HeaderMap,
    mut multipart: Multipart,
    ret_json: bool,
) -> ApiResult<Response> {
    let recv = parse_upload_headers(state, token, url_op, request_headers).await?;
    let form = parse_multipart(state, &mut multipart).await?;

    let result = handle_upload(state, &recv, &form, request_headers, ret_json).await;

    // Spooled parts are gone in every outcome; the resumable temp file is
    // cleaned inside handle_upload when the final chunk was seen.
    for (_, spool) in &form.files {
        tokio::fs::remove_file(spool).await.ok();
    }

    result
}

async fn handle_upload(
    state: &AppState,
    recv: &RecvData,
    form: &UploadForm,
    request_headers: &HeaderMap,
    ret_json: bool,
) -> ApiResult<Response> {
    let replace = match form.replace.as_deref() {
        None | Some("") => false,
        Some("0") => false,
        Some("1") => true,
        Some(_) => return Err(ApiError::BadRequest("Invalid argument".to_string())),
    };

    let parent_dir = form
        .parent_dir
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid URL".to_string()))?;
    if !parent_dir.starts_with('/') {
        return Err(ApiError::BadRequest("Invalid parent dir".to_string()));
    }
    if parent_dir.contains("//") {
        return Err(ApiError::BadRequest(
            "parent_dir contains // sequence".to_string(),
        ));
    }

    let relative_path = form.relative_path.as_deref().unwrap_or_default();
    if relative_path.starts_with('/') || relative_path.starts_with('\\') {
        return Err(ApiError::BadRequest("Invalid relative path".to_string()));
    }

    let new_parent_dir = join_paths(&join_paths("/", parent_dir), relative_path);

    // Assemble the list of completed payload files.
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    let mut resumable_key: Option<String> = None;
    if recv.rstart >= 0 {
        if form.files.len() != 1 {
            return Err(ApiError::BadRequest("More files in one request".to_string()));
        }
        let (file_name, spool) = &form.files[0];
        let file_path = join_paths(&new_parent_dir, file_name);

        let tmp_path = match state.mgr.get_upload_tmp_file(&recv.repo_id, &file_path).await {
            Some(path) => path,
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix(file_name.as_str())
                    .tempfile_in(state.config.cluster_shared_temp_dir())
                    .map_err(ApiError::internal)?;
                let (_, path) = tmp.keep().map_err(ApiError::internal)?;
                state
                    .mgr
                    .add_upload_tmp_file(&recv.repo_id, &file_path, path.clone())
                    .await;
                path
            }
        };

        // Splice this chunk into the assembly file at its offset; chunk
        // writes into one assembly file never interleave.
        let path_lock = state.mgr.upload_path_lock(&recv.repo_id, &file_path).await;
        let _write_guard = path_lock.lock().await;
        let mut assembly = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&tmp_path)
            .await
            .map_err(ApiError::internal)?;
        assembly
            .seek(std::io::SeekFrom::Start(recv.rstart as u64))
            .await
            .map_err(ApiError::internal)?;
        let mut spool_file = tokio::fs::File::open(spool).await.map_err(ApiError::internal)?;
        tokio::io::copy(&mut spool_file, &mut assembly)
            .await
            .map_err(ApiError::internal)?;
        assembly.flush().await.map_err(ApiError::internal)?;

        if recv.rend != recv.fsize - 1 {
            // More chunks to come.
            let content_type = if accepts_json(request_headers) {
                "application/json; charset=utf-8"
            } else {
                "text/plain"
            };
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type)],
                "{\"success\": true}",
            )
                .into_response());
        }

        files.push((file_name.clone(), tmp_path));
        resumable_key = Some(file_path);
    } else {
        files = form.files.clone();
        if files.is_empty() {
            return Err(ApiError::BadRequest("No file in request".to_string()));
        }
    }

    let result = commit_upload(state, recv, &files, &new_parent_dir, parent_dir, replace, ret_json)
        .await;

    // The completed assembly file and its mapping go away on success and
    // failure alike; a retry starts a fresh upload.
    if let Some(file_path) = resumable_key {
        tokio::fs::remove_file(&files[0].1).await.ok();
        state.mgr.del_upload_tmp_file(&recv.repo_id, &file_path).await;
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn commit_upload(
    state: &AppState,
    recv: &RecvData,
    files: &[(String, PathBuf)],
    new_parent_dir: &str,
    parent_dir: &str,
    replace: bool,
    ret_json: bool,
) -> ApiResult<Response> {
    let repo = state
        .mgr
        .get(&recv.repo_id)
        .await
        .map_err(|_| ApiError::internal(format!("failed to get repo {}", recv.repo_id)))?;

    for (file_name, _) in files {
        if !is_valid_filename(file_name) {
            return Err(ApiError::BadRequest(format!("invalid fileName: {file_name}")));
        }
    }

    // The form's parent_dir must be the directory the token grants.
    if join_paths("/", recv.token_parent_dir.as_str()) != join_paths("/", parent_dir) {
        return Err(ApiError::Forbidden("Permission denied.".to_string()));
    }

    // The token's parent dir must exist at the current head.
    let head = state.mgr.commits.load(&repo.id, &repo.head_commit_id).await?;
    state
        .mgr
        .fs
        .get_dir_by_path(&repo.store_id, &head.root_id, &canon_path(parent_dir))
        .await
        .map_err(|_| ApiError::BadRequest("Parent dir doesn't exist".to_string()))?;

    // Size and quota gates.
    let mut total_size: i64 = 0;
    for (_, path) in files {
        total_size += tokio::fs::metadata(path)
            .await
            .map_err(ApiError::internal)?
            .len() as i64;
    }
    if let Some(max) = state.config.max_upload_size {
        if total_size as u64 > max {
            return Err(ApiError::TooLarge);
        }
    }
    let content_len = if recv.fsize > 0 { recv.fsize } else { total_size };
    if state.oracle.check_quota(&recv.repo_id, content_len).await? != 0 {
        return Err(ApiError::QuotaExceeded);
    }

    // Materialize relative_path directories, committing if anything was
    // missing.
    let relative = canon_path(new_parent_dir);
    let parent_canon = canon_path(parent_dir);
    if relative != parent_canon {
        let rel = relative
            .strip_prefix(parent_canon.trim_end_matches('/'))
            .unwrap_or("")
            .trim_start_matches('/');
        if !rel.is_empty()
            && reef_repo::commit::mkdir_with_parents(
                &state.mgr,
                &recv.repo_id,
                &parent_canon,
                rel,
                &recv.user,
            )
            .await?
        {
            schedule_post_commit(state, &recv.repo_id);
        }
    }

    let crypt_key = if repo.is_encrypted {
        Some(parse_crypt_key(state, &recv.repo_id, &recv.user).await?)
    } else {
        None
    };

    // Chunk, hash and persist every payload file.
    let mut dents = Vec::new();
    for (file_name, path) in files {
        let (file_id, size) =
            index_file(state, &repo, path, crypt_key.as_ref()).await?;
        dents.push(DirEntry {
            name: file_name.clone(),
            id: file_id,
            mode: MODE_REG,
            mtime: now(),
            size,
            modifier: recv.user.clone(),
        });
    }

    // Tree update + commit.
    let repo = state.mgr.get(&recv.repo_id).await.map_err(ApiError::from)?;
    let head = state.mgr.commits.load(&repo.id, &repo.head_commit_id).await?;
    let mut names = Vec::new();
    let new_root = tree::post_multi_files(
        &state.mgr.fs,
        &repo.store_id,
        &head.root_id,
        &canon_path(new_parent_dir),
        &dents,
        replace,
        &recv.user,
        &mut names,
    )
    .await?;

    let desc = if dents.len() > 1 {
        format!("Added \"{}\" and {} more files.", dents[0].name, dents.len() - 1)
    } else {
        format!("Added \"{}\".", dents[0].name)
    };
    reef_repo::gen_new_commit(&state.mgr, &repo, &head, new_root, &recv.user, &desc).await?;

    schedule_post_commit(state, &recv.repo_id);
    publish_upload_event(state, recv, content_len).await?;

    // Response body.
    let entries: Vec<serde_json::Value> = names
        .iter()
        .zip(dents.iter())
        .map(|(name, dent)| {
            serde_json::json!({
                "name": name,
                "id": dent.id.to_hex(),
                "size": dent.size,
            })
        })
        .collect();

    let body = if ret_json {
        serde_json::to_string(&entries).map_err(ApiError::internal)?
    } else {
        entries
            .iter()
            .filter_map(|e| e["id"].as_str().map(str::to_string))
            .collect::<Vec<_>>()
            .join("\t")
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response())
}

/// Index one spooled file into blocks, keeping per-repo versioning.
async fn index_file(
    state: &AppState,
    repo: &Repo,
    path: &std::path::Path,
    crypt_key: Option<&CryptKey>,
) -> ApiResult<(reef_core::ObjectId, i64)> {
    index::index_blocks(
        &state.mgr.fs,
        &state.mgr.blocks,
        &repo.store_id,
        repo.version,
        path,
        crypt_key,
    )
    .await
    .map_err(|e| ApiError::internal(format!("failed to index blocks: {e}")))
}

/// Fire-and-forget work every committing mutation schedules: size
/// recomputation and virtual-repo sync.
fn schedule_post_commit(state: &AppState, repo_id: &str) {
    let sizes = state.sizes.clone();
    let mgr = state.mgr.clone();
    let repo_id = repo_id.to_string();
    tokio::spawn(async move {
        sizes.schedule(&repo_id).await;
        virtualrepo::merge_virtual_repo(&mgr, &repo_id, None).await;
    });
}

async fn publish_upload_event(state: &AppState, recv: &RecvData, bytes: i64) -> ApiResult<()> {
    let etype = if recv.token_type == "upload-link" {
        "link-file-upload"
    } else {
        "web-file-upload"
    };
    let payload = format!("{etype}\t{}\t{}\t{bytes}", recv.user, recv.repo_id);
    state
        .oracle
        .publish_event(STATS_CHANNEL, &payload)
        .await
        .map_err(|e| ApiError::internal(format!("failed to send statistic message: {e}")))?;
    Ok(())
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}
