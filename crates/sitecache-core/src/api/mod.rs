//! Remote store access.
//!
//! `RemoteStore` is the capability interface the cache consumes: one
//! uniform list/create/update/remove shape for every collection, plus the
//! per-site settings aggregate. Responses are returned as raw JSON; callers
//! decide what counts as a record (`_id` present) or "no data" (non-array list).
//!
//! Implementations:
//! - `ApiClient`: REST over HTTPS with bearer token auth
//! - `MemoryRemote`: in-process store with failure injection

pub mod client;
pub mod error;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{Collection, Payload, RemoteId};

pub use client::ApiClient;
pub use error::ApiError;
pub use memory::{FailureMode, MemoryRemote, Operation};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All records of `collection`, optionally qualified by a company or site id.
    async fn list(
        &self,
        token: &str,
        collection: Collection,
        scope_id: Option<&str>,
    ) -> Result<Value, ApiError>;

    async fn create(
        &self,
        token: &str,
        collection: Collection,
        payload: &Payload,
    ) -> Result<Value, ApiError>;

    async fn update(
        &self,
        token: &str,
        collection: Collection,
        id: &RemoteId,
        payload: &Payload,
    ) -> Result<Value, ApiError>;

    /// Delete a record. The returned status document is informational only.
    async fn remove(
        &self,
        token: &str,
        collection: Collection,
        id: &RemoteId,
    ) -> Result<Value, ApiError>;

    async fn fetch_settings(&self, token: &str, site_id: &str) -> Result<Value, ApiError>;

    /// Partial update of the site settings aggregate.
    async fn patch_settings(
        &self,
        token: &str,
        site_id: &str,
        patch: &Payload,
    ) -> Result<Value, ApiError>;
}
