//! The surface consumed by forms and lists.
//!
//! `SiteCache` owns every component (scope resolver, session, collection
//! store, local storage, CRUD facade, sync engine and refresh loop) and is
//! the only thing a consumer needs to hold. Its lifetime is tied to the
//! session: `end_session` empties everything it holds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::RemoteStore;
use crate::auth::{CurrentUser, Session, SharedSession};
use crate::cache::{CollectionState, CollectionStore, SharedStore};
use crate::config::Config;
use crate::crud::{Crud, MutationOutcome};
use crate::models::{
    Collection, NameEntry, NameList, Payload, Record, RecordId, SettingsList, SiteSettings,
};
use crate::repair::{self, RepairReport};
use crate::scope::{ScopeId, ScopeResolver, ScopeSnapshot, TenantScope};
use crate::storage::LocalStore;
use crate::sync::{spawn_refresh_loop, FetchOutcome, RefreshSummary, SyncEngine, DEFAULT_REFRESH_INTERVAL};

#[derive(Debug, Clone)]
pub struct SiteCacheOptions {
    pub refresh_interval: Duration,
}

impl Default for SiteCacheOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl From<&Config> for SiteCacheOptions {
    fn from(config: &Config) -> Self {
        Self {
            refresh_interval: config.refresh_interval(),
        }
    }
}

pub struct SiteCache {
    resolver: ScopeResolver,
    session: SharedSession,
    store: SharedStore,
    local: LocalStore,
    crud: Crud,
    engine: SyncEngine,
    focus: Arc<Notify>,
    options: SiteCacheOptions,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    repair_report: RepairReport,
}

impl SiteCache {
    /// Build the cache and run the startup repair pass over local storage.
    pub fn new(remote: Arc<dyn RemoteStore>, local: LocalStore, options: SiteCacheOptions) -> Self {
        let repair_report = repair::run(&local);

        let session: SharedSession = Arc::new(RwLock::new(Session::new()));
        let store: SharedStore = Arc::new(RwLock::new(CollectionStore::new()));
        let crud = Crud::new(Arc::clone(&remote), Arc::clone(&store), Arc::clone(&session));
        let engine = SyncEngine::new(
            remote,
            Arc::clone(&store),
            Arc::clone(&session),
            local.clone(),
            crud.clone(),
        );

        Self {
            resolver: ScopeResolver::new(),
            session,
            store,
            local,
            crud,
            engine,
            focus: Arc::new(Notify::new()),
            options,
            refresh_task: Mutex::new(None),
            repair_report,
        }
    }

    pub fn repair_report(&self) -> &RepairReport {
        &self.repair_report
    }

    // ===== Lifecycle =====

    /// Start the refresh loop. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.refresh_task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(spawn_refresh_loop(
            self.engine.clone(),
            self.resolver.subscribe(),
            Arc::clone(&self.focus),
            self.options.refresh_interval,
        ));
        info!(interval_secs = self.options.refresh_interval.as_secs(), "Refresh loop started");
    }

    pub fn shutdown(&self) {
        let mut task = self.refresh_task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Refresh loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let task = self.refresh_task.lock().unwrap_or_else(|p| p.into_inner());
        task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Adopt the signed-in user supplied by the auth collaborator. A different
    /// user replaces the previous session and everything cached for it.
    pub async fn begin_session(&self, user: CurrentUser) {
        let previous = self
            .session
            .read()
            .await
            .user()
            .map(|current| current.user_id.clone());
        if previous.is_some_and(|id| id != user.user_id) {
            self.end_session().await;
        }
        debug!(user_id = %user.user_id, "Session started");
        self.session.write().await.begin(user);
        if self.is_running() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                engine.refresh_all().await;
            });
        }
    }

    /// Drop the user, the scope and every collection held for them.
    pub async fn end_session(&self) {
        self.session.write().await.clear();
        let mut store = self.store.write().await;
        store.reset(self.resolver.end_session());
        info!("Session ended, cache cleared");
    }

    // ===== Scope =====

    /// Switch the active company. Clears the site as well.
    pub async fn set_company(&self, company: Option<ScopeId>) -> bool {
        self.switch_scope(|resolver| resolver.set_company(company)).await
    }

    pub async fn set_site(&self, site: Option<ScopeId>) -> bool {
        self.switch_scope(|resolver| resolver.set_site(site)).await
    }

    /// Publish a scope change and reset the store under one write lock, so no
    /// reader sees the new scope with the old collections. Snapshots for the
    /// new scope are restored afterwards.
    async fn switch_scope(
        &self,
        switch: impl FnOnce(&ScopeResolver) -> Option<ScopeSnapshot>,
    ) -> bool {
        let snapshot = {
            let mut store = self.store.write().await;
            let Some(snapshot) = switch(&self.resolver) else {
                return false;
            };
            store.reset(snapshot.clone());
            snapshot
        };
        self.engine.restore_snapshots(&snapshot).await;
        true
    }

    pub fn scope(&self) -> TenantScope {
        self.resolver.scope()
    }

    pub fn company_id(&self) -> Option<ScopeId> {
        self.resolver.scope().company_id
    }

    pub fn site_id(&self) -> Option<ScopeId> {
        self.resolver.scope().site_id
    }

    /// Receiver notified on every scope change.
    pub fn subscribe_scope(&self) -> watch::Receiver<ScopeSnapshot> {
        self.resolver.subscribe()
    }

    // ===== Reads =====

    pub async fn records(&self, collection: Collection) -> Vec<Record> {
        self.crud.list(collection).await
    }

    pub async fn collection_state(&self, collection: Collection) -> CollectionState {
        self.store.read().await.state(collection)
    }

    pub async fn site_settings(&self) -> SiteSettings {
        self.store.read().await.settings().clone()
    }

    // ===== Refresh =====

    pub async fn refresh_all(&self) -> RefreshSummary {
        self.engine.refresh_all().await
    }

    pub async fn refresh_collection(&self, collection: Collection) -> FetchOutcome {
        self.engine.refresh_collection(collection).await
    }

    /// Called by the host when the application returns to the foreground.
    pub fn notify_focus_regained(&self) {
        self.focus.notify_one();
    }

    // ===== Mutations =====

    pub async fn add(&self, collection: Collection, draft: Payload) -> MutationOutcome {
        self.crud.create(collection, draft).await
    }

    pub async fn update(
        &self,
        collection: Collection,
        target: RecordId,
        patch: Payload,
    ) -> MutationOutcome {
        self.crud.update(collection, target, patch).await
    }

    pub async fn delete(&self, collection: Collection, target: RecordId) -> MutationOutcome {
        self.crud.delete(collection, target).await
    }

    pub async fn add_setting_item(&self, list: SettingsList, item: &str) -> MutationOutcome {
        self.crud.add_setting_item(list, item).await
    }

    pub async fn remove_setting_item(&self, list: SettingsList, item: &str) -> MutationOutcome {
        self.crud.remove_setting_item(list, item).await
    }

    // ===== Saved name lists =====

    pub fn saved_names(&self, list: NameList) -> Vec<NameEntry> {
        self.stored_names(list)
            .iter()
            .filter_map(NameEntry::from_stored)
            .collect()
    }

    /// Add an entry unless its display name is blank or already present.
    pub fn add_saved_name(&self, list: NameList, entry: NameEntry) -> bool {
        if entry.display_name().trim().is_empty() {
            return false;
        }
        let mut stored = self.stored_names(list);
        if stored
            .iter()
            .filter_map(NameEntry::from_stored)
            .any(|e| e.display_name() == entry.display_name())
        {
            return false;
        }
        stored.push(entry.to_stored());
        self.local.set(list.storage_key(), &stored)
    }

    /// Remove entries named `name`. Stored values that are not name entries
    /// are kept as they are.
    pub fn remove_saved_name(&self, list: NameList, name: &str) -> bool {
        let mut stored = self.stored_names(list);
        let before = stored.len();
        stored.retain(|value| {
            NameEntry::from_stored(value).map_or(true, |e| e.display_name() != name)
        });
        stored.len() != before && self.local.set(list.storage_key(), &stored)
    }

    fn stored_names(&self, list: NameList) -> Vec<Value> {
        self.local.get_or_default(list.storage_key())
    }
}

impl Drop for SiteCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Typed per-collection accessors: `materials()`, `add_material(..)`,
/// `update_material(..)`, `delete_material(..)` and so on.
macro_rules! collection_accessors {
    ($($collection:ident => $list:ident, $add:ident, $update:ident, $delete:ident;)*) => {
        impl SiteCache {
            $(
                pub async fn $list(&self) -> Vec<Record> {
                    self.records(Collection::$collection).await
                }

                pub async fn $add(&self, draft: Payload) -> MutationOutcome {
                    self.add(Collection::$collection, draft).await
                }

                pub async fn $update(
                    &self,
                    target: impl Into<RecordId>,
                    patch: Payload,
                ) -> MutationOutcome {
                    self.update(Collection::$collection, target.into(), patch).await
                }

                pub async fn $delete(&self, target: impl Into<RecordId>) -> MutationOutcome {
                    self.delete(Collection::$collection, target.into()).await
                }
            )*
        }
    };
}

collection_accessors! {
    Companies => companies, add_company, update_company, delete_company;
    Sites => sites, add_site, update_site, delete_site;
    CompanyUsers => company_users, add_company_user, update_company_user, delete_company_user;
    ContactLists => contact_lists, add_contact_list, update_contact_list, delete_contact_list;
    ConcreteTests => concrete_tests, add_concrete_test, update_concrete_test, delete_concrete_test;
    SoilTests => soil_tests, add_soil_test, update_soil_test, delete_soil_test;
    SteelTests => steel_tests, add_steel_test, update_steel_test, delete_steel_test;
    BrickTests => brick_tests, add_brick_test, update_brick_test, delete_brick_test;
    Transactions => transactions, add_transaction, update_transaction, delete_transaction;
    Materials => materials, add_material, update_material, delete_material;
    MaterialRequests => material_requests, add_material_request, update_material_request, delete_material_request;
    Checklists => checklists, add_checklist, update_checklist, delete_checklist;
    Manpower => manpower, add_manpower, update_manpower, delete_manpower;
    Bills => bills, add_bill, update_bill, delete_bill;
    Inventory => inventory, add_inventory_item, update_inventory_item, delete_inventory_item;
    Documents => documents, add_document, update_document, delete_document;
    Messages => messages, add_message, update_message, delete_message;
    Estimations => estimations, add_estimation, update_estimation, delete_estimation;
    Tasks => tasks, add_task, update_task, delete_task;
    Equipment => equipment, add_equipment, update_equipment, delete_equipment;
    DailyReports => daily_reports, add_daily_report, update_daily_report, delete_daily_report;
    PurchaseOrders => purchase_orders, add_purchase_order, update_purchase_order, delete_purchase_order;
    Drawings => drawings, add_drawing, update_drawing, delete_drawing;
    Issues => issues, add_issue, update_issue, delete_issue;
    Attendance => attendance, add_attendance, update_attendance, delete_attendance;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryRemote, Operation};
    use crate::models::NamedEntity;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    const COMPANY: &str = "64b7f0c2a1e4d3b2c1a09f00";
    const SITE_A: &str = "64b7f0c2a1e4d3b2c1a09f8a";
    const SITE_B: &str = "64b7f0c2a1e4d3b2c1a09f8b";

    fn fixture_with(local: LocalStore) -> (Arc<MemoryRemote>, SiteCache) {
        let remote = Arc::new(MemoryRemote::new());
        let cache = SiteCache::new(remote.clone(), local, SiteCacheOptions::default());
        (remote, cache)
    }

    fn fixture() -> (Arc<MemoryRemote>, SiteCache) {
        fixture_with(LocalStore::new(Arc::new(MemoryBackend::new())))
    }

    fn user() -> CurrentUser {
        CurrentUser {
            user_id: "u1".into(),
            role: "engineer".into(),
            bearer_token: "token".into(),
        }
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn names(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str))
            .collect()
    }

    async fn signed_in_at(cache: &SiteCache, site: &str) {
        cache.begin_session(user()).await;
        cache.set_company(Some(COMPANY.into())).await;
        cache.set_site(Some(site.into())).await;
    }

    #[tokio::test]
    async fn test_scope_isolation_and_restore() {
        let (remote, cache) = fixture();
        remote.seed(
            Collection::Materials,
            vec![
                json!({"name": "Cement", "siteId": SITE_A}),
                json!({"name": "Sand", "siteId": SITE_B}),
            ],
        );

        signed_in_at(&cache, SITE_A).await;
        cache.refresh_all().await;
        assert_eq!(names(&cache.materials().await), vec!["Cement"]);

        cache.set_site(Some(SITE_B.into())).await;
        assert!(cache.materials().await.is_empty());
        cache.refresh_all().await;
        assert!(cache.add_material(payload(json!({"name": "Gravel"}))).await.success);
        assert_eq!(names(&cache.materials().await), vec!["Sand", "Gravel"]);

        // Back on A, the snapshot is restored before any fetch
        let lists_before = remote.call_count(Operation::List);
        cache.set_site(Some(SITE_A.into())).await;
        assert_eq!(names(&cache.materials().await), vec!["Cement"]);
        assert_eq!(remote.call_count(Operation::List), lists_before);
        assert!(cache
            .collection_state(Collection::Materials)
            .await
            .refreshed_at
            .is_some());
    }

    #[tokio::test]
    async fn test_placeholder_site_refuses_create() {
        let (remote, cache) = fixture();
        signed_in_at(&cache, "1").await;

        let outcome = cache.add_material(payload(json!({"name": "Cement"}))).await;
        assert!(!outcome.success);
        assert!(outcome.message.is_some());
        assert!(cache.materials().await.is_empty());
        assert_eq!(remote.call_count(Operation::Create), 0);
    }

    #[tokio::test]
    async fn test_company_switch_clears_site_and_company_collections() {
        let (remote, cache) = fixture();
        remote.seed(Collection::Sites, vec![json!({"name": "Tower", "companyId": COMPANY})]);
        remote.seed(Collection::Companies, vec![json!({"name": "Acme"})]);
        signed_in_at(&cache, SITE_A).await;
        cache.refresh_all().await;
        assert_eq!(cache.sites().await.len(), 1);

        assert!(cache.set_company(Some("64b7f0c2a1e4d3b2c1a09f01".into())).await);
        assert!(cache.site_id().is_none());
        assert!(cache.sites().await.is_empty());
        assert_eq!(cache.companies().await.len(), 1);

        // Same company again is not a switch
        assert!(!cache.set_company(Some("64b7f0c2a1e4d3b2c1a09f01".into())).await);
    }

    #[tokio::test]
    async fn test_end_session_clears_everything() {
        let (remote, cache) = fixture();
        remote.seed(Collection::Companies, vec![json!({"name": "Acme"})]);
        signed_in_at(&cache, SITE_A).await;
        cache.refresh_all().await;

        cache.end_session().await;
        assert!(cache.companies().await.is_empty());
        assert_eq!(cache.scope(), TenantScope::default());

        let outcome = cache.add_company(payload(json!({"name": "New"}))).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_typed_update_and_delete() {
        let (_, cache) = fixture();
        signed_in_at(&cache, SITE_A).await;

        let record = cache
            .add_task(payload(json!({"title": "Pour slab"})))
            .await
            .record
            .unwrap();
        let id = record.remote_id().cloned().unwrap();

        assert!(cache.update_task(id.clone(), payload(json!({"title": "Cure slab"}))).await.success);
        assert_eq!(cache.tasks().await[0].get("title"), Some(&json!("Cure slab")));

        assert!(cache.delete_task(id).await.success);
        assert!(cache.tasks().await.is_empty());
    }

    #[test]
    fn test_repair_runs_at_startup() {
        let local = LocalStore::new(Arc::new(MemoryBackend::new()));
        local.set("saved_parties", &json!(["A", "B", "A"]));

        let (_, cache) = fixture_with(local);
        assert_eq!(cache.repair_report().duplicates_removed, 1);
        let parties: Vec<String> = cache
            .saved_names(NameList::Parties)
            .iter()
            .map(|e| e.display_name().to_string())
            .collect();
        assert_eq!(parties, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_repaired_transaction_snapshot_is_restored() {
        let local = LocalStore::new(Arc::new(MemoryBackend::new()));
        local.save_snapshot(
            &format!("transactions_{}", SITE_A),
            &json!([{"_id": "t1", "amount": 5, "partyName": {"0": "R", "1": "a", "2": "m"}}]),
        );

        let (_, cache) = fixture_with(local);
        signed_in_at(&cache, SITE_A).await;
        let restored = cache.records(Collection::Transactions).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].get("partyName"), Some(&json!("Ram")));
    }

    #[test]
    fn test_saved_names() {
        let (_, cache) = fixture();
        assert!(cache.add_saved_name(NameList::Suppliers, NameEntry::Name("Acme".into())));
        assert!(!cache.add_saved_name(NameList::Suppliers, NameEntry::Name("Acme".into())));
        assert!(!cache.add_saved_name(NameList::Suppliers, NameEntry::Name("  ".into())));

        let bolt = NameEntry::Record(NamedEntity {
            name: "Bolt".into(),
            extra: payload(json!({"phone": "555"})),
        });
        assert!(cache.add_saved_name(NameList::Suppliers, bolt.clone()));
        assert_eq!(
            cache.saved_names(NameList::Suppliers),
            vec![NameEntry::Name("Acme".into()), bolt]
        );

        assert!(cache.remove_saved_name(NameList::Suppliers, "Acme"));
        assert!(!cache.remove_saved_name(NameList::Suppliers, "Acme"));
        assert_eq!(cache.saved_names(NameList::Suppliers).len(), 1);
        assert!(cache.saved_names(NameList::Categories).is_empty());
    }

    #[test]
    fn test_saved_names_keep_unrecognised_entries() {
        let local = LocalStore::new(Arc::new(MemoryBackend::new()));
        local.set("saved_parties", &json!(["Ram", 42, {"phone": "555"}]));
        let (_, cache) = fixture_with(local.clone());

        assert!(cache.add_saved_name(NameList::Parties, NameEntry::Name("Shyam".into())));
        assert_eq!(
            local.get_value("saved_parties"),
            Some(json!(["Ram", 42, {"phone": "555"}, "Shyam"]))
        );

        assert!(cache.remove_saved_name(NameList::Parties, "Ram"));
        assert_eq!(
            local.get_value("saved_parties"),
            Some(json!([42, {"phone": "555"}, "Shyam"]))
        );
    }

    #[tokio::test]
    async fn test_new_user_replaces_previous_session() {
        let (remote, cache) = fixture();
        remote.seed(Collection::Materials, vec![json!({"name": "Cement", "siteId": SITE_A})]);
        signed_in_at(&cache, SITE_A).await;
        cache.refresh_all().await;
        assert_eq!(cache.materials().await.len(), 1);

        // Same user again keeps everything
        cache.begin_session(user()).await;
        assert_eq!(cache.materials().await.len(), 1);

        cache
            .begin_session(CurrentUser {
                user_id: "u2".into(),
                ..user()
            })
            .await;
        assert!(cache.materials().await.is_empty());
        assert_eq!(cache.scope(), TenantScope::default());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (remote, cache) = fixture();
        cache.start();
        assert!(cache.is_running());

        cache.begin_session(user()).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.calls_for(Operation::List, Collection::Companies), 1);

        cache.shutdown();
        assert!(!cache.is_running());
    }
}
