use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::migration::{MigrationReport, Migrator};
use crate::api::RemoteStore;
use crate::auth::SharedSession;
use crate::cache::SharedStore;
use crate::crud::Crud;
use crate::models::{Collection, Record, SiteSettings};
use crate::scope::{ScopeId, ScopeSnapshot, TenantScope};
use crate::storage::keys::scoped_key;
use crate::storage::LocalStore;

/// What happened to one collection during a refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// The collection was replaced with `count` records.
    Applied { count: usize, migrated: usize },
    /// The response was not a sequence; the collection was left as is.
    Unchanged,
    /// The remote call failed; the collection was left as is.
    Failed,
    /// The scope moved on while the fetch was in flight; the result was dropped.
    Stale,
    /// Another fetch of the same collection and generation was already running.
    Deduplicated,
    /// The required scope is missing or still a placeholder.
    Skipped,
}

/// Per-collection outcomes of one `refresh_all` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub outcomes: Vec<(Collection, FetchOutcome)>,
    pub settings_loaded: bool,
}

impl RefreshSummary {
    fn count(&self, pred: impl Fn(&FetchOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Applied { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Failed | FetchOutcome::Unchanged))
    }

    pub fn stale(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Stale))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FetchOutcome::Skipped | FetchOutcome::Deduplicated))
    }

    pub fn migrated(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                FetchOutcome::Applied { migrated, .. } => *migrated,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, collection: Collection) -> Option<&FetchOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| *c == collection)
            .map(|(_, o)| o)
    }
}

/// Local storage key of a collection's snapshot under `scope`.
///
/// `None` when the collection's scope is missing or not remote-valid;
/// placeholder scopes never get a snapshot.
pub fn snapshot_key(collection: Collection, scope: &TenantScope) -> Option<String> {
    match scope.qualifier(collection.scope_kind()).ok()? {
        Some(id) => Some(scoped_key(collection.name(), id.as_str())),
        None => Some(collection.name().to_string()),
    }
}

type InFlight = Arc<Mutex<HashSet<(Collection, u64)>>>;

/// Marks a (collection, generation) fetch as running until dropped.
struct InFlightGuard {
    set: InFlight,
    key: (Collection, u64),
}

impl InFlightGuard {
    fn acquire(set: &InFlight, collection: Collection, generation: u64) -> Option<Self> {
        let key = (collection, generation);
        let mut running = set.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(key) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut running = self.set.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.key);
    }
}

/// Fetches collections for the active scope and applies the results.
///
/// Each fetch captures the scope generation it was issued under; the
/// collection store drops the result if the generation moved on before the
/// response arrived. Failures are logged and leave the collection untouched.
#[derive(Clone)]
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    store: SharedStore,
    session: SharedSession,
    local: LocalStore,
    migrator: Migrator,
    in_flight: InFlight,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: SharedStore,
        session: SharedSession,
        local: LocalStore,
        crud: Crud,
    ) -> Self {
        Self {
            migrator: Migrator::new(crud, local.clone()),
            remote,
            store,
            session,
            local,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn token(&self) -> Option<String> {
        self.session.read().await.token().map(str::to_string)
    }

    async fn current_snapshot(&self) -> ScopeSnapshot {
        self.store.read().await.snapshot().clone()
    }

    /// Fetch every collection whose scope is valid, plus the site settings.
    ///
    /// Site-scoped collections are skipped while the site is missing or a
    /// placeholder; global and company collections are still fetched.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let Some(token) = self.token().await else {
            debug!("Refresh skipped, no session");
            return RefreshSummary::default();
        };
        let snapshot = self.current_snapshot().await;

        let fetches = Collection::ALL
            .into_iter()
            .map(|collection| self.fetch(&token, collection, &snapshot));
        let settings = self.fetch_settings(&token, &snapshot);
        let (outcomes, settings_loaded) = futures::join!(join_all(fetches), settings);

        let summary = RefreshSummary {
            outcomes: Collection::ALL.into_iter().zip(outcomes).collect(),
            settings_loaded,
        };
        info!(
            applied = summary.applied(),
            failed = summary.failed(),
            stale = summary.stale(),
            skipped = summary.skipped(),
            migrated = summary.migrated(),
            "Refresh complete"
        );
        summary
    }

    /// Fetch a single collection for the active scope.
    pub async fn refresh_collection(&self, collection: Collection) -> FetchOutcome {
        let Some(token) = self.token().await else {
            return FetchOutcome::Skipped;
        };
        let snapshot = self.current_snapshot().await;
        self.fetch(&token, collection, &snapshot).await
    }

    async fn fetch(
        &self,
        token: &str,
        collection: Collection,
        snapshot: &ScopeSnapshot,
    ) -> FetchOutcome {
        let kind = collection.scope_kind();
        let qualifier = match snapshot.scope.qualifier(kind) {
            Ok(q) => q.cloned(),
            Err(_) => return FetchOutcome::Skipped,
        };
        let generation = snapshot.generations.for_kind(kind);
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, collection, generation) else {
            debug!(%collection, "Fetch already in flight");
            return FetchOutcome::Deduplicated;
        };

        let response = match self
            .remote
            .list(token, collection, qualifier.as_ref().map(ScopeId::as_str))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(%collection, error = %e, "Fetch failed, keeping previous records");
                return FetchOutcome::Failed;
            }
        };
        let Value::Array(items) = response else {
            debug!(%collection, "Fetch returned a non-sequence, leaving collection unchanged");
            return FetchOutcome::Unchanged;
        };

        let mut records: Vec<Record> = items
            .into_iter()
            .filter_map(|item| match Record::from_remote(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(%collection, error = %e, "Dropping non-conforming record");
                    None
                }
            })
            .collect();

        let mut migrated = 0;
        if let Some(site) = qualifier.as_ref().filter(|_| collection.is_legacy_migratable()) {
            if self.migrator.is_pending(collection, site, records.is_empty()) {
                let MigrationReport { created, .. } =
                    self.migrator.migrate(token, collection, site).await;
                migrated = created.len();
                for record in created {
                    if !records.iter().any(|r| r.remote_id() == record.remote_id()) {
                        records.push(record);
                    }
                }
            }
        }

        let count = records.len();
        let applied = self
            .store
            .write()
            .await
            .apply_fetch(collection, generation, records.clone());
        if !applied {
            debug!(%collection, generation, "Discarding fetch for previous scope");
            return FetchOutcome::Stale;
        }

        if let Some(key) = snapshot_key(collection, &snapshot.scope) {
            let data: Vec<Value> = records.iter().map(Record::to_json).collect();
            self.local.save_snapshot(&key, &data);
        }
        debug!(%collection, count, "Collection refreshed");
        FetchOutcome::Applied { count, migrated }
    }

    async fn fetch_settings(&self, token: &str, snapshot: &ScopeSnapshot) -> bool {
        let Some(site) = snapshot.scope.remote_site() else {
            return false;
        };
        let settings = match self.remote.fetch_settings(token, site.as_str()).await {
            Ok(value @ Value::Object(_)) => match serde_json::from_value::<SiteSettings>(value) {
                Ok(settings) => settings,
                Err(e) => {
                    debug!(site = %site, error = %e, "Ignoring malformed site settings");
                    return false;
                }
            },
            Ok(_) => return false,
            Err(e) => {
                warn!(site = %site, error = %e, "Failed to fetch site settings");
                return false;
            }
        };
        self.store
            .write()
            .await
            .set_settings(snapshot.generations.site, settings)
    }

    /// Load persisted snapshots for `snapshot`'s scope into every collection
    /// that has not been populated under the current generation yet.
    pub async fn restore_snapshots(&self, snapshot: &ScopeSnapshot) -> usize {
        let mut restored = 0;
        let mut store = self.store.write().await;
        for collection in Collection::ALL {
            let Some(key) = snapshot_key(collection, &snapshot.scope) else {
                continue;
            };
            if store.state(collection).refreshed_at.is_some() {
                continue;
            }
            let Some(cached) = self.local.load_snapshot::<Vec<Value>>(&key) else {
                continue;
            };
            let records: Vec<Record> = cached
                .data
                .into_iter()
                .filter_map(|value| Record::from_remote(value).ok())
                .collect();
            let generation = snapshot.generations.for_kind(collection.scope_kind());
            if store.apply_at(collection, generation, records, cached.cached_at) {
                restored += 1;
            }
        }
        if restored > 0 {
            debug!(restored, "Restored collection snapshots");
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FailureMode, MemoryRemote, Operation};
    use crate::auth::{CurrentUser, Session};
    use crate::cache::CollectionStore;
    use crate::scope::{ScopeGenerations, PLACEHOLDER_ID};
    use crate::storage::keys::legacy_key;
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use tokio::sync::RwLock;

    const COMPANY: &str = "64b7f0c2a1e4d3b2c1a09f00";
    const SITE: &str = "64b7f0c2a1e4d3b2c1a09f8e";

    struct Fixture {
        remote: Arc<MemoryRemote>,
        store: SharedStore,
        local: LocalStore,
        engine: SyncEngine,
    }

    fn scope(site: &str) -> ScopeSnapshot {
        ScopeSnapshot {
            scope: TenantScope {
                company_id: Some(COMPANY.into()),
                site_id: Some(site.into()),
            },
            generations: ScopeGenerations { session: 1, company: 1, site: 1 },
        }
    }

    fn fixture(site: &str) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let local = LocalStore::new(Arc::new(MemoryBackend::new()));
        let mut store = CollectionStore::new();
        store.reset(scope(site));
        let store = Arc::new(RwLock::new(store));
        let mut session = Session::new();
        session.begin(CurrentUser {
            user_id: "u1".into(),
            role: "engineer".into(),
            bearer_token: "token".into(),
        });
        let session = Arc::new(RwLock::new(session));
        let crud = Crud::new(remote.clone(), store.clone(), session.clone());
        let engine = SyncEngine::new(remote.clone(), store.clone(), session, local.clone(), crud);
        Fixture { remote, store, local, engine }
    }

    #[tokio::test]
    async fn test_refresh_applies_and_persists() {
        let f = fixture(SITE);
        f.remote.seed(
            Collection::Materials,
            vec![
                json!({"name": "Cement", "siteId": SITE}),
                json!({"name": "Sand", "siteId": "64b7f0c2a1e4d3b2c1a09fff"}),
            ],
        );
        f.remote.seed_settings(SITE, json!({"units": ["bags"]}));

        let summary = f.engine.refresh_all().await;
        assert_eq!(
            summary.outcome(Collection::Materials),
            Some(&FetchOutcome::Applied { count: 1, migrated: 0 })
        );
        assert_eq!(summary.applied(), Collection::ALL.len());
        assert!(summary.settings_loaded);

        let store = f.store.read().await;
        assert_eq!(store.records(Collection::Materials).len(), 1);
        assert_eq!(store.settings().units, vec!["bags"]);

        let key = format!("materials_{}", SITE);
        let cached = f.local.load_snapshot::<Vec<Value>>(&key).unwrap();
        assert_eq!(cached.data[0]["name"], "Cement");
        assert!(f.local.contains("companies"));
    }

    #[tokio::test]
    async fn test_placeholder_site_skips_site_collections() {
        let f = fixture(PLACEHOLDER_ID);
        let summary = f.engine.refresh_all().await;

        assert_eq!(summary.outcome(Collection::Materials), Some(&FetchOutcome::Skipped));
        assert!(matches!(
            summary.outcome(Collection::Sites),
            Some(FetchOutcome::Applied { .. })
        ));
        assert_eq!(f.remote.calls_for(Operation::List, Collection::Materials), 0);
        assert_eq!(f.remote.call_count(Operation::FetchSettings), 0);
        assert!(!summary.settings_loaded);
    }

    #[tokio::test]
    async fn test_non_sequence_and_failures_keep_previous_records() {
        let f = fixture(SITE);
        f.remote.seed(Collection::Bills, vec![json!({"amount": 5, "siteId": SITE})]);
        f.engine.refresh_collection(Collection::Bills).await;

        f.remote.fail(Operation::List, FailureMode::ErrorShape);
        assert_eq!(
            f.engine.refresh_collection(Collection::Bills).await,
            FetchOutcome::Unchanged
        );
        f.remote.fail(Operation::List, FailureMode::Transport);
        assert_eq!(
            f.engine.refresh_collection(Collection::Bills).await,
            FetchOutcome::Failed
        );
        assert_eq!(f.store.read().await.len(Collection::Bills), 1);
    }

    #[tokio::test]
    async fn test_stale_fetch_is_discarded() {
        let f = fixture(SITE);
        f.remote.seed(Collection::Tasks, vec![json!({"title": "A", "siteId": SITE})]);
        f.remote.hold_lists();

        let engine = f.engine.clone();
        let fetch = tokio::spawn(async move { engine.refresh_collection(Collection::Tasks).await });
        while f.remote.calls_for(Operation::List, Collection::Tasks) == 0 {
            tokio::task::yield_now().await;
        }

        let mut next = scope("64b7f0c2a1e4d3b2c1a09f8f");
        next.generations.site = 2;
        f.store.write().await.reset(next);
        f.remote.release_lists(1);

        assert_eq!(fetch.await.unwrap(), FetchOutcome::Stale);
        assert!(f.store.read().await.is_empty(Collection::Tasks));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_deduplicated() {
        let f = fixture(SITE);
        f.remote.hold_lists();

        let first = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.refresh_collection(Collection::Issues).await })
        };
        while f.remote.calls_for(Operation::List, Collection::Issues) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            f.engine.refresh_collection(Collection::Issues).await,
            FetchOutcome::Deduplicated
        );
        f.remote.release_lists(1);
        assert!(matches!(first.await.unwrap(), FetchOutcome::Applied { count: 0, .. }));
        assert_eq!(f.remote.calls_for(Operation::List, Collection::Issues), 1);
    }

    #[tokio::test]
    async fn test_migration_runs_once_on_empty_remote() {
        let f = fixture(SITE);
        let legacy = legacy_key("concrete_tests", SITE);
        f.local.set(&legacy, &json!([{"location": "A"}, {"location": "B", "id": 7}]));

        let outcome = f.engine.refresh_collection(Collection::ConcreteTests).await;
        assert_eq!(outcome, FetchOutcome::Applied { count: 2, migrated: 2 });

        let remote = f.remote.records(Collection::ConcreteTests);
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().all(|r| r["siteId"] == SITE && r.get("id").is_none()));
        assert!(!f.local.contains(&legacy));
        assert_eq!(f.store.read().await.len(Collection::ConcreteTests), 2);

        f.engine.refresh_collection(Collection::ConcreteTests).await;
        assert_eq!(f.remote.call_count(Operation::Create), 2);
        assert_eq!(f.store.read().await.len(Collection::ConcreteTests), 2);
    }

    #[tokio::test]
    async fn test_no_migration_when_remote_has_records() {
        let f = fixture(SITE);
        let legacy = legacy_key("tasks", SITE);
        f.local.set(&legacy, &json!([{"title": "old"}]));
        f.remote.seed(Collection::Tasks, vec![json!({"title": "new", "siteId": SITE})]);

        f.engine.refresh_collection(Collection::Tasks).await;
        assert_eq!(f.remote.call_count(Operation::Create), 0);
        assert!(f.local.contains(&legacy));
    }

    #[tokio::test]
    async fn test_restore_snapshots_fills_unpopulated_collections() {
        let f = fixture(SITE);
        f.local.save_snapshot(
            &format!("materials_{}", SITE),
            &vec![json!({"_id": "abc", "name": "Cement"}), json!({"id": 4, "name": "pending"})],
        );

        assert_eq!(f.engine.restore_snapshots(&scope(SITE)).await, 1);
        let store = f.store.read().await;
        assert_eq!(store.len(Collection::Materials), 1);
        assert_eq!(store.state(Collection::Materials).age_display(), "just now");
    }

    #[test]
    fn test_snapshot_key() {
        let scope = scope(SITE).scope;
        assert_eq!(
            snapshot_key(Collection::Materials, &scope),
            Some(format!("materials_{}", SITE))
        );
        assert_eq!(
            snapshot_key(Collection::Sites, &scope),
            Some(format!("sites_{}", COMPANY))
        );
        assert_eq!(snapshot_key(Collection::Companies, &scope), Some("companies".into()));

        let placeholder = TenantScope {
            site_id: Some(PLACEHOLDER_ID.into()),
            ..scope
        };
        assert_eq!(snapshot_key(Collection::Materials, &placeholder), None);
    }
}
