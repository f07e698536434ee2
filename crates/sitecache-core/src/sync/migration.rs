use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crud::Crud;
use crate::models::{strip_identity, Collection, Payload, Record};
use crate::scope::ScopeId;
use crate::storage::keys::{ledger_key, legacy_key};
use crate::storage::LocalStore;

/// Result of one migration attempt for a collection on a site.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Records confirmed remotely during this attempt.
    pub created: Vec<Record>,
    /// Entries already confirmed by an earlier, interrupted attempt.
    pub already_confirmed: usize,
    /// Legacy entries that were not objects and cannot be submitted.
    pub discarded: usize,
    /// Set when a create failed and the batch stopped.
    pub error: Option<String>,
}

impl MigrationReport {
    /// True if every legacy entry is now on the remote.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// SHA-256 of a payload's canonical JSON form, as lowercase hex.
fn content_hash(payload: &Payload) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Promotes legacy locally-cached records into the remote store.
///
/// A batch is transactional: the legacy key is only removed once every entry
/// has been confirmed. Entries confirmed before a failure are recorded by
/// content hash in a ledger key, so a retry submits only what is left. The
/// ledger is a multiset: identical entries are matched one ledger hash each.
#[derive(Clone)]
pub struct Migrator {
    crud: Crud,
    local: LocalStore,
    running: Arc<Mutex<()>>,
}

impl Migrator {
    pub fn new(crud: Crud, local: LocalStore) -> Self {
        Self {
            crud,
            local,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a fetch result should trigger migration.
    ///
    /// Runs when the remote is empty, or when an earlier attempt left a
    /// ledger behind (the remote then already holds part of the batch).
    pub fn is_pending(&self, collection: Collection, site: &ScopeId, remote_empty: bool) -> bool {
        if !collection.is_legacy_migratable() || !site.is_remote_valid() {
            return false;
        }
        let resuming = self.local.contains(&ledger_key(collection.name(), site.as_str()));
        (remote_empty || resuming)
            && self.local.contains(&legacy_key(collection.name(), site.as_str()))
    }

    pub async fn migrate(&self, token: &str, collection: Collection, site: &ScopeId) -> MigrationReport {
        let _running = self.running.lock().await;
        let legacy = legacy_key(collection.name(), site.as_str());
        let ledger = ledger_key(collection.name(), site.as_str());
        let mut report = MigrationReport::default();

        let entries: Vec<Value> = self.local.get_or_default(&legacy);
        if entries.is_empty() {
            debug!(%collection, site = %site, "No legacy records to migrate");
            return report;
        }
        let mut confirmed: Vec<String> = self.local.get_or_default(&ledger);
        // Hashes from earlier attempts not yet matched to an entry
        let mut earlier = confirmed.clone();

        for entry in entries {
            let Value::Object(payload) = entry else {
                report.discarded += 1;
                continue;
            };
            let mut payload = strip_identity(payload);
            if let Some(field) = collection.scope_kind().payload_field() {
                payload.insert(field.to_string(), Value::from(site.as_str()));
            }

            let hash = content_hash(&payload);
            if let Some(pos) = earlier.iter().position(|h| *h == hash) {
                earlier.swap_remove(pos);
                report.already_confirmed += 1;
                continue;
            }

            match self.crud.create_remote(token, collection, &payload).await {
                Ok(record) => {
                    report.created.push(record);
                    confirmed.push(hash);
                    self.local.set(&ledger, &confirmed);
                }
                Err(e) => {
                    warn!(
                        %collection,
                        site = %site,
                        created = report.created.len(),
                        error = %e,
                        "Migration stopped, legacy records kept for retry"
                    );
                    report.error = Some(e);
                    return report;
                }
            }
        }

        self.local.remove(&legacy);
        self.local.remove(&ledger);
        info!(
            %collection,
            site = %site,
            created = report.created.len(),
            already_confirmed = report.already_confirmed,
            "Legacy records migrated"
        );
        report
    }
}
