//! In-memory entity collections.
//!
//! `CollectionStore` maps each `Collection` to its ordered records for the
//! active scope. It is written only by the sync engine (wholesale replace)
//! and the CRUD facade (single-record insert, replace, remove).

pub mod store;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use store::{CollectionState, CollectionStore};

/// Shared handle used by the engine, facade and context surface.
pub type SharedStore = Arc<RwLock<CollectionStore>>;
