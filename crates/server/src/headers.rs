//! Response header helpers shared by the download and zip paths.

use axum::http::header::{self, HeaderMap, HeaderValue};

/// Map a file extension to its content type.
///
/// Unknown extensions fall through to `application/octet-stream` at the
/// call site.
pub fn parse_content_type(file_name: &str) -> Option<&'static str> {
    let suffix = file_name.rsplit('.').next()?;
    if suffix == file_name {
        // No dot at all.
        return None;
    }
    let content_type = match suffix.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "doc" => "application/vnd.ms-word",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp3" => "audio/mp3",
        "mpeg" => "video/mpeg",
        "mp4" => "video/mp4",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(content_type)
}

/// Whether the request came from Firefox, which wants the RFC 5987 form
/// of Content-Disposition filenames.
pub fn is_firefox(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| ua.to_ascii_lowercase().contains("firefox"))
}

/// Set Content-Type, Content-Disposition and sniffing headers the way
/// every download-ish response does.
pub fn set_common_headers(
    headers: &mut HeaderMap,
    operation: &str,
    file_name: &str,
    user_agent: Option<&str>,
    text_charset: &str,
) {
    let file_type = parse_content_type(file_name);
    let content_type = match file_type {
        Some(t) if t.starts_with("text") => format!("{t}; charset={text_charset}"),
        Some(t) => t.to_string(),
        None => "application/octet-stream".to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let attachment = matches!(operation, "download" | "download-link" | "downloadblks");
    let disposition = if attachment {
        if is_firefox(user_agent) {
            format!("attachment;filename*=\"utf-8' '{file_name}\"")
        } else {
            format!("attachment;filename*=\"{file_name}\"")
        }
    } else if is_firefox(user_agent) {
        format!("inline;filename*=\"utf-8' '{file_name}\"")
    } else {
        format!("inline;filename=\"{file_name}\"")
    };
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if file_type != Some("image/jpeg") {
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
    }
}

/// Set the cache headers every access endpoint sends.
pub fn set_cache_headers(headers: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&http_date()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=3600"),
    );
}

/// Current time as an IMF-fixdate HTTP date.
pub fn http_date() -> String {
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}
