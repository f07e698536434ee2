use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{Collection, Record, RecordId, SiteSettings};
use crate::scope::{ScopeGenerations, ScopeKind, ScopeSnapshot};
use crate::storage::age_display;

/// Contents of one collection plus when they last came from the remote.
#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    pub records: Vec<Record>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CollectionState {
    pub fn age_display(&self) -> String {
        self.refreshed_at
            .map(age_display)
            .unwrap_or_else(|| "never".to_string())
    }

    pub fn is_stale(&self, max_age_minutes: i64) -> bool {
        match self.refreshed_at {
            Some(at) => (Utc::now() - at).num_minutes() > max_age_minutes,
            None => true,
        }
    }
}

/// In-memory collections for the active scope.
///
/// The store keeps its own copy of the scope snapshot it was last reset to,
/// so readers holding the lock see collections and scope that agree.
/// Every mutation carries the scope generation it was issued under. A write
/// whose generation no longer matches the store's is dropped, so results
/// from a previous scope can never land in the current one.
#[derive(Debug, Default)]
pub struct CollectionStore {
    collections: HashMap<Collection, CollectionState>,
    settings: SiteSettings,
    snapshot: ScopeSnapshot,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the held collections belong to.
    pub fn snapshot(&self) -> &ScopeSnapshot {
        &self.snapshot
    }

    pub fn generations(&self) -> ScopeGenerations {
        self.snapshot.generations
    }

    fn is_current(&self, collection: Collection, generation: u64) -> bool {
        self.generations().for_kind(collection.scope_kind()) == generation
    }

    /// Adopt a new scope, emptying every collection whose generation moved on.
    pub fn reset(&mut self, snapshot: ScopeSnapshot) {
        let old = self.generations();
        let generations = snapshot.generations;
        for kind in [ScopeKind::Global, ScopeKind::Company, ScopeKind::Site] {
            if old.for_kind(kind) != generations.for_kind(kind) {
                self.collections.retain(|c, _| c.scope_kind() != kind);
                if kind == ScopeKind::Site {
                    self.settings = SiteSettings::default();
                }
                debug!(?kind, "Cleared collections for previous scope");
            }
        }
        self.snapshot = snapshot;
    }

    // ===== Reads =====

    pub fn records(&self, collection: Collection) -> &[Record] {
        self.collections
            .get(&collection)
            .map(|s| s.records.as_slice())
            .unwrap_or(&[])
    }

    pub fn state(&self, collection: Collection) -> CollectionState {
        self.collections.get(&collection).cloned().unwrap_or_default()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.records(collection).len()
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    pub fn find(&self, collection: Collection, target: &RecordId) -> Option<&Record> {
        self.records(collection).iter().find(|r| r.matches(target))
    }

    pub fn settings(&self) -> &SiteSettings {
        &self.settings
    }

    // ===== Wholesale replacement (sync engine) =====

    /// Replace a collection with freshly fetched records.
    pub fn apply_fetch(
        &mut self,
        collection: Collection,
        generation: u64,
        records: Vec<Record>,
    ) -> bool {
        self.apply_at(collection, generation, records, Utc::now())
    }

    /// Replace a collection with records fetched at `refreshed_at`.
    pub fn apply_at(
        &mut self,
        collection: Collection,
        generation: u64,
        records: Vec<Record>,
        refreshed_at: DateTime<Utc>,
    ) -> bool {
        if !self.is_current(collection, generation) {
            return false;
        }
        self.collections.insert(
            collection,
            CollectionState {
                records,
                refreshed_at: Some(refreshed_at),
            },
        );
        true
    }

    pub fn set_settings(&mut self, generation: u64, settings: SiteSettings) -> bool {
        if self.generations().site != generation {
            return false;
        }
        self.settings = settings;
        true
    }

    // ===== Single-record mutation (CRUD) =====

    pub fn insert(&mut self, collection: Collection, generation: u64, record: Record) -> bool {
        if !self.is_current(collection, generation) {
            return false;
        }
        self.collections
            .entry(collection)
            .or_default()
            .records
            .push(record);
        true
    }

    /// Replace the record matching `target` in place.
    pub fn replace(
        &mut self,
        collection: Collection,
        generation: u64,
        target: &RecordId,
        record: Record,
    ) -> bool {
        if !self.is_current(collection, generation) {
            return false;
        }
        let Some(state) = self.collections.get_mut(&collection) else {
            return false;
        };
        match state.records.iter_mut().find(|r| r.matches(target)) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    pub fn remove(
        &mut self,
        collection: Collection,
        generation: u64,
        target: &RecordId,
    ) -> Option<Record> {
        if !self.is_current(collection, generation) {
            return None;
        }
        let state = self.collections.get_mut(&collection)?;
        let index = state.records.iter().position(|r| r.matches(target))?;
        Some(state.records.remove(index))
    }
}
