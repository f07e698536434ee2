//! Remote refresh, legacy migration and the refresh loop.
//!
//! - `SyncEngine` fetches collections for the active scope and applies them
//!   to the collection store, guarded by scope generations
//! - `Migrator` promotes legacy local records when the remote is empty
//! - `spawn_refresh_loop` drives `refresh_all` from a timer, focus events
//!   and scope activation

pub mod engine;
pub mod migration;
pub mod scheduler;

pub use engine::{snapshot_key, FetchOutcome, RefreshSummary, SyncEngine};
pub use migration::{MigrationReport, Migrator};
pub use scheduler::{spawn_refresh_loop, Trigger, DEFAULT_REFRESH_INTERVAL};
