//! Client traits for the external RPC oracles.
//!
//! Token issuance, decryption keys, quota accounting and the event bus
//! all live outside the data plane behind an RPC boundary. The trait
//! keeps that boundary explicit; tests plug in an in-memory fake.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// A failed oracle call.
#[derive(Debug, Error)]
#[error("oracle call failed: {0}")]
pub struct OracleError(pub String);

/// Result type for oracle calls.
pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// What an access token resolves to.
#[derive(Debug, Clone, Deserialize)]
pub struct WebAccessInfo {
    #[serde(rename = "repo-id")]
    pub repo_id: String,
    /// A file/dir object id, or a JSON payload for zip and upload tokens.
    #[serde(rename = "obj-id")]
    pub obj_id: String,
    pub op: String,
    pub username: String,
}

/// Decryption key material for an encrypted repo, hex-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct DecryptKey {
    pub key: String,
    pub iv: String,
}

/// RPC surface the data plane consumes.
#[async_trait]
pub trait RpcOracle: Send + Sync {
    /// Resolve an opaque access token. None means the token is unknown.
    async fn query_access_token(&self, token: &str) -> OracleResult<Option<WebAccessInfo>>;

    /// Fetch the block decryption key for `(repo, user)`.
    async fn get_decrypt_key(&self, repo_id: &str, user: &str) -> OracleResult<Option<DecryptKey>>;

    /// Ask the quota service whether `delta` more bytes fit; nonzero means
    /// over quota.
    async fn check_quota(&self, repo_id: &str, delta: i64) -> OracleResult<i64>;

    /// Publish an event to the stats bus.
    async fn publish_event(&self, channel: &str, payload: &str) -> OracleResult<()>;
}

/// JSON-over-HTTP oracle client.
///
/// Calls are POSTed to the gateway as `{"method": ..., "params": [...]}`;
/// the reply body is the method's result (JSON `null` for absent values).
pub struct HttpRpcOracle {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRpcOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> OracleResult<serde_json::Value> {
        let response = self
            .http
            .post(&self.base_url)
            .json(&serde_json::json!({ "method": method, "params": params }))
            .send()
            .await
            .map_err(|e| OracleError(format!("{method}: {e}")))?;
        if !response.status().is_success() {
            return Err(OracleError(format!("{method}: HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| OracleError(format!("{method}: {e}")))
    }
}

#[async_trait]
impl RpcOracle for HttpRpcOracle {
    async fn query_access_token(&self, token: &str) -> OracleResult<Option<WebAccessInfo>> {
        let value = self
            .call("seafile_web_query_access_token", serde_json::json!([token]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| OracleError(format!("bad access token shape: {e}")))
    }

    async fn get_decrypt_key(&self, repo_id: &str, user: &str) -> OracleResult<Option<DecryptKey>> {
        let value = self
            .call("seafile_get_decrypt_key", serde_json::json!([repo_id, user]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| OracleError(format!("bad decrypt key shape: {e}")))
    }

    async fn check_quota(&self, repo_id: &str, delta: i64) -> OracleResult<i64> {
        let value = self
            .call("check_quota", serde_json::json!([repo_id, delta]))
            .await?;
        value
            .as_i64()
            .ok_or_else(|| OracleError("bad quota reply".to_string()))
    }

    async fn publish_event(&self, channel: &str, payload: &str) -> OracleResult<()> {
        self.call("publish_event", serde_json::json!([channel, payload]))
            .await?;
        Ok(())
    }
}
