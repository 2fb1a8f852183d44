//! Server test utilities.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use reef_core::fs::{DirEntry, FileObject};
use reef_core::{AppConfig, ObjectId, BLOCK_SIZE, MODE_REG};
use reef_metadata::SqliteStore;
use reef_repo::registry::now;
use reef_repo::{gen_new_commit, RepoManager};
use reef_server::oracle::{DecryptKey, OracleResult, RpcOracle, WebAccessInfo};
use reef_server::{create_router, AppState};
use reef_storage::FilesystemBackend;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

/// In-memory stand-in for the external RPC oracles.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockOracle {
    tokens: Mutex<HashMap<String, WebAccessInfo>>,
    keys: Mutex<HashMap<String, DecryptKey>>,
    /// check_quota reply; nonzero means over quota.
    pub quota_reply: AtomicI64,
    pub events: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl MockOracle {
    pub fn grant(&self, token: &str, repo_id: &str, obj_id: &str, op: &str, user: &str) {
        self.tokens.lock().unwrap().insert(
            token.to_string(),
            WebAccessInfo {
                repo_id: repo_id.to_string(),
                obj_id: obj_id.to_string(),
                op: op.to_string(),
                username: user.to_string(),
            },
        );
    }

    pub fn set_decrypt_key(&self, repo_id: &str, key: &str, iv: &str) {
        self.keys.lock().unwrap().insert(
            repo_id.to_string(),
            DecryptKey {
                key: key.to_string(),
                iv: iv.to_string(),
            },
        );
    }
}

#[async_trait]
impl RpcOracle for MockOracle {
    async fn query_access_token(&self, token: &str) -> OracleResult<Option<WebAccessInfo>> {
        Ok(self.tokens.lock().unwrap().get(token).cloned())
    }

    async fn get_decrypt_key(&self, repo_id: &str, _user: &str) -> OracleResult<Option<DecryptKey>> {
        Ok(self.keys.lock().unwrap().get(repo_id).cloned())
    }

    async fn check_quota(&self, _repo_id: &str, _delta: i64) -> OracleResult<i64> {
        Ok(self.quota_reply.load(Ordering::SeqCst))
    }

    async fn publish_event(&self, channel: &str, payload: &str) -> OracleResult<()> {
        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

/// A test server wrapper with all dependencies.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub oracle: Arc<MockOracle>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        let metadata = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"))
                .await
                .expect("failed to create metadata store"),
        );
        let objects = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("storage"))
                .await
                .expect("failed to create storage backend"),
        );
        let mgr = Arc::new(RepoManager::new(metadata, objects));

        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let oracle = Arc::new(MockOracle::default());
        let state = AppState::new(config, mgr, oracle.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            oracle,
            _temp_dir: temp_dir,
        }
    }

    pub fn mgr(&self) -> Arc<RepoManager> {
        self.state.mgr.clone()
    }

    /// Send a request through the router.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Store `data` as blocks + file object and commit it into
    /// `parent_dir/name`. Returns the file object id.
    pub async fn seed_file(
        &self,
        repo_id: &str,
        parent_dir: &str,
        name: &str,
        data: &[u8],
    ) -> ObjectId {
        let mgr = self.mgr();
        let repo = mgr.get(repo_id).await.unwrap();

        let mut block_ids = Vec::new();
        for chunk in data.chunks(BLOCK_SIZE as usize) {
            let id = mgr
                .blocks
                .write(&repo.store_id, Bytes::from(chunk.to_vec()))
                .await
                .unwrap();
            block_ids.push(id);
        }
        let file = FileObject::new(repo.version, data.len() as u64, block_ids);
        let file_id = mgr.fs.save_file(&repo.store_id, &file).await.unwrap();

        let dent = DirEntry {
            name: name.to_string(),
            id: file_id,
            mode: MODE_REG,
            mtime: now(),
            size: data.len() as i64,
            modifier: "alice@example.com".to_string(),
        };
        let head = mgr.commits.load(&repo.id, &repo.head_commit_id).await.unwrap();
        let mut names = Vec::new();
        let new_root = reef_repo::tree::post_multi_files(
            &mgr.fs,
            &repo.store_id,
            &head.root_id,
            parent_dir,
            &[dent],
            false,
            "alice@example.com",
            &mut names,
        )
        .await
        .unwrap();
        gen_new_commit(&mgr, &repo, &head, new_root, "alice@example.com", "seed")
            .await
            .unwrap();
        file_id
    }
}

/// Collect a response body into bytes.
#[allow(dead_code)]
pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

/// Build a multipart/form-data body.
/// Fields are `(name, filename, content)`; filename is None for scalars.
#[allow(dead_code)]
pub fn multipart_body(
    boundary: &str,
    fields: &[(&str, Option<&str>, &[u8])],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
