//! Upload pipeline tests: multipart, resumable chunking, quota gates.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{body_bytes, multipart_body, TestServer};
use reef_metadata::SizeRepo;
use std::sync::atomic::Ordering;

const BOUNDARY: &str = "reefboundary";

fn upload_request(uri: &str, fields: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(BOUNDARY, fields)))
        .unwrap()
}

/// Repo "r1" with /d created, plus an upload token for /d.
async fn server_with_upload_token(parent_dir: &str) -> TestServer {
    let server = TestServer::new().await;
    server.mgr().create_repo("r1", "docs", "alice").await.unwrap();
    if parent_dir != "/" {
        reef_repo::commit::mkdir_with_parents(
            &server.mgr(),
            "r1",
            "/",
            parent_dir.trim_start_matches('/'),
            "alice",
        )
        .await
        .unwrap();
    }
    let payload = format!("{{\"parent_dir\": \"{parent_dir}\"}}");
    server.oracle.grant("tok", "r1", &payload, "upload", "alice");
    server
}

async fn read_file(server: &TestServer, repo_id: &str, path: &str) -> Option<Vec<u8>> {
    let mgr = server.mgr();
    let repo = mgr.get(repo_id).await.unwrap();
    let entry = mgr
        .fs
        .get_dirent_by_path(&repo.store_id, &repo.root_id, path)
        .await
        .unwrap()?;
    let file = mgr.fs.get_file(&repo.store_id, &entry.id).await.unwrap();
    let mut out = Vec::new();
    for id in &file.block_ids {
        out.extend_from_slice(&mgr.blocks.read(&repo.store_id, id).await.unwrap());
    }
    Some(out)
}

#[tokio::test]
async fn upload_commits_file_and_returns_json() {
    let server = server_with_upload_token("/d").await;

    let response = server
        .request(upload_request(
            "/upload-api/tok?ret-json=1",
            &[
                ("parent_dir", None, b"/d"),
                ("file", Some("hello.txt"), b"hello world"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "hello.txt");
    assert_eq!(entries[0]["size"], 11);
    assert_eq!(entries[0]["id"].as_str().unwrap().len(), 40);

    assert_eq!(
        read_file(&server, "r1", "/d/hello.txt").await.unwrap(),
        b"hello world"
    );

    // The upload published a stats event.
    let events = server.oracle.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].1.starts_with("web-file-upload\talice\tr1\t"));
}

#[tokio::test]
async fn plain_api_response_is_tab_joined_ids() {
    let server = server_with_upload_token("/d").await;

    let response = server
        .request(upload_request(
            "/upload-api/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("file", Some("a.txt"), b"a"),
                ("file", Some("b.txt"), b"b"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    let ids: Vec<&str> = std::str::from_utf8(&body).unwrap().split('\t').collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.len() == 40));
}

#[tokio::test]
async fn colliding_name_is_disambiguated() {
    let server = server_with_upload_token("/d").await;
    server.seed_file("r1", "/d", "a.txt", b"original").await;

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("replace", None, b"0"),
                ("file", Some("a.txt"), b"second"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body[0]["name"], "a (1).txt");

    assert_eq!(read_file(&server, "r1", "/d/a.txt").await.unwrap(), b"original");
    assert_eq!(
        read_file(&server, "r1", "/d/a (1).txt").await.unwrap(),
        b"second"
    );
}

#[tokio::test]
async fn replace_mode_overwrites_in_place() {
    let server = server_with_upload_token("/d").await;
    server.seed_file("r1", "/d", "a.txt", b"original").await;

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("replace", None, b"1"),
                ("file", Some("a.txt"), b"second"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_file(&server, "r1", "/d/a.txt").await.unwrap(), b"second");
    assert!(read_file(&server, "r1", "/d/a (1).txt").await.is_none());
}

#[tokio::test]
async fn invalid_replace_value_is_rejected() {
    let server = server_with_upload_token("/d").await;
    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("replace", None, b"2"),
                ("file", Some("a.txt"), b"x"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn parent_dir_mismatch_is_forbidden() {
    let server = server_with_upload_token("/d").await;
    reef_repo::commit::mkdir_with_parents(&server.mgr(), "r1", "/", "other", "alice")
        .await
        .unwrap();

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/other"),
                ("file", Some("a.txt"), b"x"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_parent_dir_is_rejected() {
    let server = server_with_upload_token("/d").await;
    let payload = "{\"parent_dir\": \"/nonexistent\"}";
    server.oracle.grant("tok2", "r1", payload, "upload", "alice");

    let response = server
        .request(upload_request(
            "/upload-aj/tok2",
            &[
                ("parent_dir", None, b"/nonexistent"),
                ("file", Some("a.txt"), b"x"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn quota_exhaustion_responds_443() {
    let server = server_with_upload_token("/d").await;
    server.oracle.quota_reply.store(1, Ordering::SeqCst);

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[("parent_dir", None, b"/d"), ("file", Some("a.txt"), b"x")],
        ))
        .await;
    assert_eq!(response.status().as_u16(), 443);
}

#[tokio::test]
async fn oversized_upload_responds_442() {
    let server = TestServer::with_config(|config| {
        config.max_upload_size = Some(4);
    })
    .await;
    server.mgr().create_repo("r1", "docs", "alice").await.unwrap();
    server
        .oracle
        .grant("tok", "r1", "{\"parent_dir\": \"/\"}", "upload", "alice");

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[("parent_dir", None, b"/"), ("file", Some("a.txt"), b"way too big")],
        ))
        .await;
    assert_eq!(response.status().as_u16(), 442);
}

#[tokio::test]
async fn relative_path_directories_are_materialized() {
    let server = server_with_upload_token("/d").await;

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("relative_path", None, b"photos/2026"),
                ("file", Some("pic.png"), b"png"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_file(&server, "r1", "/d/photos/2026/pic.png").await.unwrap(),
        b"png"
    );
}

#[tokio::test]
async fn absolute_relative_path_is_rejected() {
    let server = server_with_upload_token("/d").await;
    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[
                ("parent_dir", None, b"/d"),
                ("relative_path", None, b"/abs"),
                ("file", Some("a.txt"), b"x"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn options_preflight_carries_cors_headers() {
    let server = TestServer::new().await;
    for uri in ["/upload-aj/anything", "/upload-api/anything"] {
        let request = Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = server.request(request).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .is_some());
    }
}

fn chunk_request(uri: &str, range: &str, chunk: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_RANGE, range)
        .header(header::ACCEPT, "application/json")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(
            BOUNDARY,
            &[
                ("parent_dir", None, b"/d"),
                ("file", Some("big.bin"), chunk),
            ],
        )))
        .unwrap()
}

#[tokio::test]
async fn resumable_upload_assembles_chunks() {
    let server = server_with_upload_token("/d").await;
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();

    for (range, chunk) in [
        ("bytes 0-999/3000", &data[0..1000]),
        ("bytes 1000-1999/3000", &data[1000..2000]),
    ] {
        let response = server.request(chunk_request("/upload-aj/tok", range, chunk)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.as_ref(), b"{\"success\": true}");
        // Intermediate chunks leave the temp mapping in place.
        assert!(server
            .mgr()
            .get_upload_tmp_file("r1", "/d/big.bin")
            .await
            .is_some());
    }

    let response = server
        .request(chunk_request(
            "/upload-aj/tok",
            "bytes 2000-2999/3000",
            &data[2000..3000],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], "big.bin");
    assert_eq!(body[0]["size"], 3000);

    assert_eq!(read_file(&server, "r1", "/d/big.bin").await.unwrap(), data);
    // The mapping is gone once the final chunk committed.
    assert!(server
        .mgr()
        .get_upload_tmp_file("r1", "/d/big.bin")
        .await
        .is_none());
}

#[tokio::test]
async fn chunked_upload_rejects_multiple_file_parts() {
    let server = server_with_upload_token("/d").await;
    let request = Request::builder()
        .method("POST")
        .uri("/upload-aj/tok")
        .header(header::CONTENT_RANGE, "bytes 0-2/10")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(
            BOUNDARY,
            &[
                ("parent_dir", None, b"/d"),
                ("file", Some("a"), b"abc"),
                ("file", Some("b"), b"def"),
            ],
        )))
        .unwrap();
    let response = server.request(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_schedules_size_recompute() {
    let server = server_with_upload_token("/d").await;

    let response = server
        .request(upload_request(
            "/upload-aj/tok",
            &[("parent_dir", None, b"/d"), ("file", Some("a.txt"), b"12345")],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The size worker runs asynchronously; poll briefly.
    let mgr = server.mgr();
    let mut size = None;
    for _ in 0..50 {
        if let Some(row) = mgr.metadata.get_repo_size("r1").await.unwrap() {
            size = Some(row.size);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(size, Some(5));
}
