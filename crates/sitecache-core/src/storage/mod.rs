//! Persistent local key-value storage.
//!
//! `LocalStore` wraps a `StorageBackend` and never surfaces failures:
//! quota and serialization errors are logged and the caller carries on
//! with in-memory state.
//!
//! Key families:
//! - Global keys such as `saved_parties`
//! - Scoped snapshots `<collection>_<scopeId>`
//! - Legacy migration sources `vini_<collection>_<siteId>`

pub mod backend;
pub mod keys;
pub mod local;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use local::{age_display, CachedData, LocalStore};
