//! Scoped client-side cache for a multi-tenant remote store.
//!
//! Holds site- and company-scoped entity collections in memory, refreshes
//! them from the remote store, reconciles create/update/delete results,
//! promotes legacy local records, and repairs corrupted local entries.
//! `SiteCache` in [`context`] wires everything together.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod crud;
pub mod models;
pub mod repair;
pub mod scope;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, ApiError, RemoteStore};
pub use auth::CurrentUser;
pub use config::Config;
pub use context::{SiteCache, SiteCacheOptions};
pub use crud::{MutationOutcome, Refusal};
pub use models::{Collection, NameEntry, NameList, Payload, Record, RecordId, SettingsList};
pub use repair::RepairReport;
pub use scope::{ScopeId, TenantScope};
pub use storage::{FileBackend, LocalStore, MemoryBackend};
pub use sync::{FetchOutcome, RefreshSummary};
