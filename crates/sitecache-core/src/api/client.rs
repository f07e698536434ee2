//! HTTP implementation of the remote store.
//!
//! Every collection follows the same REST layout under the base URL:
//! `GET /{endpoint}?siteId=..`, `POST /{endpoint}`, `PUT /{endpoint}/{id}`,
//! `DELETE /{endpoint}/{id}`. Site settings live at `/sites/{id}/settings`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, RemoteStore};
use crate::models::{Collection, Payload, RemoteId};
use crate::scope::ScopeKind;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// REST client for the remote store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/{}", self.base_url, collection.endpoint())
    }

    fn record_url(&self, collection: Collection, id: &RemoteId) -> String {
        format!("{}/{}/{}", self.base_url, collection.endpoint(), id)
    }

    fn settings_url(&self, site_id: &str) -> String {
        format!("{}/sites/{}/settings", self.base_url, site_id)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, retrying with exponential backoff while rate limited.
    async fn send(
        &self,
        method: Method,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
        body: Option<&Payload>,
    ) -> Result<Value, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    debug!(%method, url, bytes = text.len(), "Remote response received");
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("{} {}: {}", method, url, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for ApiClient {
    async fn list(
        &self,
        token: &str,
        collection: Collection,
        scope_id: Option<&str>,
    ) -> Result<Value, ApiError> {
        let url = self.collection_url(collection);
        let query: Vec<(&str, &str)> = match (Self::scope_param(collection.scope_kind()), scope_id) {
            (Some(field), Some(id)) => vec![(field, id)],
            _ => Vec::new(),
        };
        self.send(Method::GET, &url, token, &query, None).await
    }

    async fn create(
        &self,
        token: &str,
        collection: Collection,
        payload: &Payload,
    ) -> Result<Value, ApiError> {
        let url = self.collection_url(collection);
        self.send(Method::POST, &url, token, &[], Some(payload)).await
    }

    async fn update(
        &self,
        token: &str,
        collection: Collection,
        id: &RemoteId,
        payload: &Payload,
    ) -> Result<Value, ApiError> {
        let url = self.record_url(collection, id);
        self.send(Method::PUT, &url, token, &[], Some(payload)).await
    }

    async fn remove(
        &self,
        token: &str,
        collection: Collection,
        id: &RemoteId,
    ) -> Result<Value, ApiError> {
        let url = self.record_url(collection, id);
        self.send(Method::DELETE, &url, token, &[], None).await
    }

    async fn fetch_settings(&self, token: &str, site_id: &str) -> Result<Value, ApiError> {
        let url = self.settings_url(site_id);
        self.send(Method::GET, &url, token, &[], None).await
    }

    async fn patch_settings(
        &self,
        token: &str,
        site_id: &str,
        patch: &Payload,
    ) -> Result<Value, ApiError> {
        let url = self.settings_url(site_id);
        self.send(Method::PATCH, &url, token, &[], Some(patch)).await
    }
}

impl ApiClient {
    /// Query parameter name used to qualify a list by scope.
    pub fn scope_param(kind: ScopeKind) -> Option<&'static str> {
        kind.payload_field()
    }
}
