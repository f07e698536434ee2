//! Storage key layout.
//!
//! Every key is a plain string; scoped keys append `_<scopeId>` so that a
//! key written for one scope is never read while another is active.

/// Prefix used by the pre-sync local cache.
const LEGACY_PREFIX: &str = "vini";

/// Prefix for partial-migration ledgers.
const LEDGER_PREFIX: &str = "migrated";

/// `<name>_<scopeId>`
pub fn scoped_key(name: &str, scope_id: &str) -> String {
    format!("{}_{}", name, scope_id)
}

/// Legacy local-cache key for a collection on a site, used only as a migration source.
pub fn legacy_key(collection: &str, site_id: &str) -> String {
    format!("{}_{}_{}", LEGACY_PREFIX, collection, site_id)
}

/// Prefix shared by every legacy key of a collection.
pub fn legacy_prefix(collection: &str) -> String {
    format!("{}_{}_", LEGACY_PREFIX, collection)
}

/// Ledger of legacy entries already confirmed remotely during an unfinished migration.
pub fn ledger_key(collection: &str, site_id: &str) -> String {
    format!("{}_{}_{}", LEDGER_PREFIX, collection, site_id)
}
