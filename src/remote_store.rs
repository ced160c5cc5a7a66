//! Remote store adapter: authenticated reads and writes of named keys.
//!
//! Pure I/O. Nothing here retries, caches or consults connectivity; callers
//! own the policy and receive every failure as a [`SyncError`].

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app_error::{SyncError, SyncResult};
use crate::cache_entry::DocumentKind;
use crate::config::SyncConfig;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Writes `value` as the authoritative copy of `key`.
    async fn push(&self, key: &str, value: &JsonValue, timestamp: i64) -> SyncResult<()>;

    /// Reads `key`. `Ok(None)` means the remote has nothing for it.
    async fn pull(&self, key: &str) -> SyncResult<Option<JsonValue>>;

    /// Tells the remote that a new `kind` document was accepted.
    ///
    /// Returns whether the remote asks clients to purge their dependent caches.
    async fn request_invalidation(&self, kind: DocumentKind) -> SyncResult<bool>;
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    success: bool,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClearResponse {
    success: bool,
    #[serde(default)]
    clear_local_storage: bool,
}

#[derive(Debug, Serialize)]
struct SaveRequest<'a> {
    key: &'a str,
    data: &'a JsonValue,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ClearRequest<'a> {
    document_type: &'a str,
}

/// JSON-over-HTTP implementation against the `/data/*` and `/chat/*` endpoints.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpRemoteStore {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Sets the bearer credential attached to every subsequent request.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear_token(&self) {
        self.token.write().take();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn push(&self, key: &str, value: &JsonValue, timestamp: i64) -> SyncResult<()> {
        let body = SaveRequest {
            key,
            data: value,
            timestamp,
        };
        let response: SaveResponse = self
            .authorize(self.client.post(self.url("/data/save")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.success {
            Ok(())
        } else {
            Err(SyncError::RemoteUnsuccessful(
                response.error.unwrap_or_else(|| format!("save of '{key}' refused")),
            ))
        }
    }

    async fn pull(&self, key: &str) -> SyncResult<Option<JsonValue>> {
        let response: LoadResponse = self
            .authorize(self.client.get(self.url("/data/load")))
            .query(&[("key", key)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.success {
            debug!("Remote has no data for '{key}'");
            return Ok(None);
        }
        Ok(response.data.filter(|data| !data.is_null()))
    }

    async fn request_invalidation(&self, kind: DocumentKind) -> SyncResult<bool> {
        let body = ClearRequest {
            document_type: kind.as_str(),
        };
        let response: ClearResponse = self
            .authorize(self.client.post(self.url("/chat/clear-local-storage")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !response.success {
            return Err(SyncError::RemoteUnsuccessful(format!(
                "invalidation for '{kind}' refused"
            )));
        }
        Ok(response.clear_local_storage)
    }
}
