//! Data models for cached entities.
//!
//! - `Collection`: the closed set of entity collections and their scope
//! - `Record`: a pending or confirmed record with a free-form payload
//! - `NameEntry`: saved reference-list entries (name or full object)
//! - `SiteSettings`: the per-site aggregate of saved trades, material names and units

pub mod collection;
pub mod name_entry;
pub mod record;
pub mod settings;

pub use collection::Collection;
pub use name_entry::{recover_indexed_string, NameEntry, NameList, NamedEntity};
pub use record::{strip_identity, LocalId, Payload, Record, RecordError, RecordId, RemoteId};
pub use settings::{SettingsLink, SettingsList, SiteSettings};
