use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::outcome::{MutationOutcome, Refusal};
use crate::api::RemoteStore;
use crate::auth::SharedSession;
use crate::cache::SharedStore;
use crate::models::{
    strip_identity, Collection, Payload, Record, RecordId, SettingsList, SiteSettings,
};
use crate::scope::ScopeId;

/// Create/update/delete for every collection, reconciling remote results
/// into the collection store.
///
/// No operation returns an error: refusals and remote failures come back as
/// a `MutationOutcome` with `success == false`.
#[derive(Clone)]
pub struct Crud {
    remote: Arc<dyn RemoteStore>,
    store: SharedStore,
    session: SharedSession,
}

impl Crud {
    pub fn new(remote: Arc<dyn RemoteStore>, store: SharedStore, session: SharedSession) -> Self {
        Self {
            remote,
            store,
            session,
        }
    }

    async fn token(&self) -> Option<String> {
        self.session.read().await.token().map(str::to_string)
    }

    /// Current contents of a collection. Never fetches.
    pub async fn list(&self, collection: Collection) -> Vec<Record> {
        self.store.read().await.records(collection).to_vec()
    }

    // ===== Create =====

    /// Create a record in the active scope.
    ///
    /// A pending record is shown immediately and swapped for the confirmed
    /// record once the remote accepts it; on failure it is removed again.
    pub async fn create(&self, collection: Collection, draft: Payload) -> MutationOutcome {
        let Some(token) = self.token().await else {
            return MutationOutcome::refused(Refusal::NoSession);
        };

        let kind = collection.scope_kind();
        let (qualifier, generation) = {
            let store = self.store.read().await;
            let snapshot = store.snapshot();
            match snapshot.scope.qualifier(kind) {
                Ok(q) => (q.cloned(), snapshot.generations.for_kind(kind)),
                Err(kind) => {
                    debug!(%collection, "Create refused, scope not valid for remote");
                    return MutationOutcome::refused(Refusal::missing_scope(kind));
                }
            }
        };

        let mut payload = strip_identity(draft);
        if let (Some(field), Some(id)) = (kind.payload_field(), &qualifier) {
            payload.insert(field.to_string(), Value::from(id.as_str()));
        }

        let pending = Record::pending(payload.clone());
        let placeholder = pending.identity();
        let local_id = pending.local_id();
        self.store.write().await.insert(collection, generation, pending);

        match self.create_remote(&token, collection, &payload).await {
            Ok(record) => {
                let record = record.with_local_id(local_id);
                {
                    let mut store = self.store.write().await;
                    let confirmed = record.identity();
                    // A refresh may have replaced the collection while the create was in flight
                    if !store.replace(collection, generation, &placeholder, record.clone())
                        && store.find(collection, &confirmed).is_none()
                    {
                        store.insert(collection, generation, record.clone());
                    }
                }
                if let Some(site) = qualifier.filter(|_| !collection.settings_links().is_empty()) {
                    self.save_linked_settings(&token, collection, &record, &site, generation)
                        .await;
                }
                info!(%collection, "Record created");
                MutationOutcome::succeeded(record)
            }
            Err(message) => {
                self.store
                    .write()
                    .await
                    .remove(collection, generation, &placeholder);
                MutationOutcome::failed(message)
            }
        }
    }

    /// Submit a payload and interpret the response as a confirmed record.
    /// Does not touch the collection store.
    pub(crate) async fn create_remote(
        &self,
        token: &str,
        collection: Collection,
        payload: &Payload,
    ) -> Result<Record, String> {
        match self.remote.create(token, collection, payload).await {
            Ok(value) => Record::from_remote(value).map_err(|e| {
                warn!(%collection, error = %e, "Create returned a non-conforming response");
                e.to_string()
            }),
            Err(e) => {
                warn!(%collection, error = %e, "Create failed");
                Err(e.to_string())
            }
        }
    }

    // ===== Update =====

    pub async fn update(
        &self,
        collection: Collection,
        target: RecordId,
        patch: Payload,
    ) -> MutationOutcome {
        let Some(token) = self.token().await else {
            return MutationOutcome::refused(Refusal::NoSession);
        };

        let kind = collection.scope_kind();
        let (remote_id, local_id, generation, site) = {
            let store = self.store.read().await;
            let snapshot = store.snapshot();
            let (remote_id, local_id) = match store.find(collection, &target) {
                None => return MutationOutcome::refused(Refusal::NotFound),
                Some(Record::Pending { .. }) => {
                    return MutationOutcome::refused(Refusal::PendingRecord)
                }
                Some(Record::Confirmed { id, local_id, .. }) => (id.clone(), *local_id),
            };
            (
                remote_id,
                local_id,
                snapshot.generations.for_kind(kind),
                snapshot.scope.remote_site().cloned(),
            )
        };

        let payload = strip_identity(patch);
        let record = match self.remote.update(&token, collection, &remote_id, &payload).await {
            Ok(value) => match Record::from_remote(value) {
                Ok(record) => record.with_local_id(local_id),
                Err(e) => {
                    warn!(%collection, id = %remote_id, error = %e, "Update returned a non-conforming response");
                    return MutationOutcome::failed(e.to_string());
                }
            },
            Err(e) => {
                warn!(%collection, id = %remote_id, error = %e, "Update failed");
                return MutationOutcome::failed(e.to_string());
            }
        };

        self.store
            .write()
            .await
            .replace(collection, generation, &target, record.clone());

        if let Some(site) = site.filter(|_| !collection.settings_links().is_empty()) {
            self.save_linked_settings(&token, collection, &record, &site, generation)
                .await;
        }
        debug!(%collection, id = %remote_id, "Record updated");
        MutationOutcome::succeeded(record)
    }

    // ===== Delete =====

    /// Delete a record. It leaves the collection as soon as the remote call
    /// returns without error, whatever the returned status says.
    pub async fn delete(&self, collection: Collection, target: RecordId) -> MutationOutcome {
        let Some(token) = self.token().await else {
            return MutationOutcome::refused(Refusal::NoSession);
        };

        let kind = collection.scope_kind();
        let (remote_id, generation) = {
            let store = self.store.read().await;
            let remote_id = match store.find(collection, &target) {
                None => return MutationOutcome::refused(Refusal::NotFound),
                Some(Record::Pending { .. }) => {
                    return MutationOutcome::refused(Refusal::PendingRecord)
                }
                Some(Record::Confirmed { id, .. }) => id.clone(),
            };
            (remote_id, store.generations().for_kind(kind))
        };

        if let Err(e) = self.remote.remove(&token, collection, &remote_id).await {
            warn!(%collection, id = %remote_id, error = %e, "Delete failed, keeping record");
            return MutationOutcome::failed(e.to_string());
        }

        match self.store.write().await.remove(collection, generation, &target) {
            Some(record) => {
                debug!(%collection, id = %remote_id, "Record deleted");
                MutationOutcome::succeeded(record)
            }
            None => MutationOutcome::done(),
        }
    }

    // ===== Site settings =====

    /// Save any linked field values of `record` into the site settings aggregate.
    async fn save_linked_settings(
        &self,
        token: &str,
        collection: Collection,
        record: &Record,
        site: &ScopeId,
        generation: u64,
    ) {
        let values: Vec<(SettingsList, String)> = collection
            .settings_links()
            .iter()
            .filter_map(|link| {
                record
                    .get(link.field)
                    .and_then(Value::as_str)
                    .map(|v| (link.list, v.to_string()))
            })
            .collect();

        let result = self
            .edit_settings(token, site, generation, |settings| {
                let mut changed = Vec::new();
                for (list, value) in &values {
                    if settings.add(*list, value) && !changed.contains(list) {
                        changed.push(*list);
                    }
                }
                changed
            })
            .await;

        if let Err(e) = result {
            warn!(%collection, site = %site, error = %e, "Failed to update site settings");
        }
    }

    pub async fn add_setting_item(&self, list: SettingsList, item: &str) -> MutationOutcome {
        self.change_setting(list, |settings| settings.add(list, item))
            .await
    }

    pub async fn remove_setting_item(&self, list: SettingsList, item: &str) -> MutationOutcome {
        self.change_setting(list, |settings| settings.remove(list, item))
            .await
    }

    async fn change_setting(
        &self,
        list: SettingsList,
        edit: impl FnOnce(&mut SiteSettings) -> bool,
    ) -> MutationOutcome {
        let Some(token) = self.token().await else {
            return MutationOutcome::refused(Refusal::NoSession);
        };
        let (site, generation) = {
            let store = self.store.read().await;
            let snapshot = store.snapshot();
            match snapshot.scope.remote_site() {
                Some(site) => (site.clone(), snapshot.generations.site),
                None => return MutationOutcome::refused(Refusal::NoActiveSite),
            }
        };

        let result = self
            .edit_settings(&token, &site, generation, |settings| {
                if edit(settings) {
                    vec![list]
                } else {
                    Vec::new()
                }
            })
            .await;

        match result {
            Ok(_) => MutationOutcome::done(),
            Err(e) => {
                warn!(site = %site, list = list.field(), error = %e, "Settings update failed");
                MutationOutcome::failed(e)
            }
        }
    }

    /// Apply `edit` to a copy of the settings and send the changed lists as a
    /// partial update. The store only takes the edit once the remote accepts
    /// it. Returns Ok(false) when nothing changed.
    async fn edit_settings(
        &self,
        token: &str,
        site: &ScopeId,
        generation: u64,
        edit: impl FnOnce(&mut SiteSettings) -> Vec<SettingsList>,
    ) -> Result<bool, String> {
        let (edited, changed) = {
            let store = self.store.read().await;
            if store.generations().site != generation {
                return Err("Site changed before settings were saved".to_string());
            }
            let mut settings = store.settings().clone();
            let changed = edit(&mut settings);
            if changed.is_empty() {
                return Ok(false);
            }
            (settings, changed)
        };

        self.remote
            .patch_settings(token, site.as_str(), &edited.patch_for(&changed))
            .await
            .map_err(|e| e.to_string())?;

        let mut store = self.store.write().await;
        let mut settings = store.settings().clone();
        settings.take_lists(&edited, &changed);
        store.set_settings(generation, settings);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FailureMode, MemoryRemote, Operation};
    use crate::auth::{CurrentUser, Session};
    use crate::cache::CollectionStore;
    use crate::models::RemoteId;
    use crate::scope::{ScopeGenerations, ScopeSnapshot, TenantScope, PLACEHOLDER_ID};
    use serde_json::json;
    use tokio::sync::RwLock;

    const COMPANY: &str = "64b7f0c2a1e4d3b2c1a09f00";
    const SITE: &str = "64b7f0c2a1e4d3b2c1a09f8e";
    const OTHER_SITE: &str = "64b7f0c2a1e4d3b2c1a09f8f";

    struct Fixture {
        remote: Arc<MemoryRemote>,
        store: SharedStore,
        crud: Crud,
    }

    async fn fixture(site: Option<&str>, signed_in: bool) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let mut store = CollectionStore::new();
        store.reset(ScopeSnapshot {
            scope: TenantScope {
                company_id: Some(COMPANY.into()),
                site_id: site.map(ScopeId::from),
            },
            generations: ScopeGenerations { session: 1, company: 1, site: 1 },
        });
        let store = Arc::new(RwLock::new(store));

        let mut session = Session::new();
        if signed_in {
            session.begin(CurrentUser {
                user_id: "u1".into(),
                role: "admin".into(),
                bearer_token: "token".into(),
            });
        }
        let crud = Crud::new(remote.clone(), store.clone(), Arc::new(RwLock::new(session)));
        Fixture { remote, store, crud }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    /// Move the store to another site, as a site switch does.
    async fn switch_site(store: &SharedStore, site: &str) {
        store.write().await.reset(ScopeSnapshot {
            scope: TenantScope {
                company_id: Some(COMPANY.into()),
                site_id: Some(site.into()),
            },
            generations: ScopeGenerations { session: 1, company: 1, site: 2 },
        });
    }

    async fn wait_for_call(remote: &MemoryRemote, op: Operation) {
        while remote.call_count(op) == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_create_refused_without_session() {
        let f = fixture(Some(SITE), false).await;
        let outcome = f.crud.create(Collection::Materials, payload(json!({"name": "Cement"}))).await;
        assert!(!outcome.success);
        assert_eq!(outcome.refusal, Some(Refusal::NoSession));
        assert_eq!(f.remote.call_count(Operation::Create), 0);
    }

    #[tokio::test]
    async fn test_create_refused_on_placeholder_site() {
        let f = fixture(Some(PLACEHOLDER_ID), true).await;
        let outcome = f.crud.create(Collection::Materials, payload(json!({"name": "Cement"}))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.refusal, Some(Refusal::NoActiveSite));
        assert!(f.crud.list(Collection::Materials).await.is_empty());
        assert_eq!(f.remote.call_count(Operation::Create), 0);
    }

    #[tokio::test]
    async fn test_company_collection_allowed_without_site() {
        let f = fixture(None, true).await;
        let outcome = f.crud.create(Collection::Sites, payload(json!({"name": "Tower B"}))).await;
        assert!(outcome.success);
        assert_eq!(
            outcome.record.unwrap().scope_id("companyId"),
            Some(COMPANY)
        );
    }

    #[tokio::test]
    async fn test_create_appends_confirmed_record() {
        let f = fixture(Some(SITE), true).await;
        let outcome = f
            .crud
            .create(Collection::ConcreteTests, payload(json!({"id": 99, "location": "A"})))
            .await;

        assert!(outcome.success);
        let record = outcome.record.unwrap();
        assert!(record.is_confirmed());
        assert_eq!(record.scope_id("siteId"), Some(SITE));
        assert!(record.get("id").is_none());

        let listed = f.crud.list(Collection::ConcreteTests).await;
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_collection_unchanged() {
        let f = fixture(Some(SITE), true).await;
        f.crud.create(Collection::Bills, payload(json!({"amount": 10}))).await;
        let before = f.crud.list(Collection::Bills).await.len();

        f.remote.fail(Operation::Create, FailureMode::Transport);
        let outcome = f.crud.create(Collection::Bills, payload(json!({"amount": 20}))).await;
        assert!(!outcome.success);
        assert!(!outcome.is_refusal());
        assert_eq!(f.crud.list(Collection::Bills).await.len(), before);

        f.remote.fail(Operation::Create, FailureMode::ErrorShape);
        let outcome = f.crud.create(Collection::Bills, payload(json!({"amount": 30}))).await;
        assert_eq!(outcome.message.as_deref(), Some("Create rejected"));
        assert_eq!(f.crud.list(Collection::Bills).await.len(), before);
    }

    #[tokio::test]
    async fn test_create_across_site_switch_stays_out_of_new_site() {
        let f = fixture(Some(SITE), true).await;
        f.remote.hold(Operation::Create);

        let crud = f.crud.clone();
        let task = tokio::spawn(async move {
            crud.create(Collection::Materials, payload(json!({"name": "Cement"})))
                .await
        });
        wait_for_call(&f.remote, Operation::Create).await;
        assert_eq!(f.crud.list(Collection::Materials).await.len(), 1);

        switch_site(&f.store, OTHER_SITE).await;
        assert!(f.crud.list(Collection::Materials).await.is_empty());

        f.remote.release(Operation::Create, 1);
        let outcome = task.await.unwrap();
        assert!(outcome.success);
        assert!(f.crud.list(Collection::Materials).await.is_empty());
        // Linked settings are not written from the new site's aggregate
        assert_eq!(f.remote.call_count(Operation::PatchSettings), 0);
    }

    #[tokio::test]
    async fn test_delete_across_site_switch_leaves_new_site_alone() {
        let f = fixture(Some(SITE), true).await;
        let created = f
            .crud
            .create(Collection::Materials, payload(json!({"name": "Cement"})))
            .await
            .record
            .unwrap();
        f.remote.hold(Operation::Remove);

        let crud = f.crud.clone();
        let target = created.identity();
        let task = tokio::spawn(async move { crud.delete(Collection::Materials, target).await });
        wait_for_call(&f.remote, Operation::Remove).await;

        // The new site happens to list a record with the same identity
        switch_site(&f.store, OTHER_SITE).await;
        f.store
            .write()
            .await
            .apply_fetch(Collection::Materials, 2, vec![created.clone()]);

        f.remote.release(Operation::Remove, 1);
        task.await.unwrap();
        assert_eq!(f.crud.list(Collection::Materials).await, vec![created]);
    }

    #[tokio::test]
    async fn test_update_by_local_identity() {
        let f = fixture(Some(SITE), true).await;
        let created = f
            .crud
            .create(Collection::Tasks, payload(json!({"title": "Pour slab"})))
            .await
            .record
            .unwrap();
        let local = created.local_id().unwrap();

        let outcome = f
            .crud
            .update(Collection::Tasks, RecordId::Local(local), payload(json!({"title": "Pour slab L2"})))
            .await;
        assert!(outcome.success);

        let listed = f.crud.list(Collection::Tasks).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get("title"), Some(&json!("Pour slab L2")));
        assert_eq!(listed[0].remote_id(), created.remote_id());
    }

    #[tokio::test]
    async fn test_update_failure_keeps_record() {
        let f = fixture(Some(SITE), true).await;
        let created = f
            .crud
            .create(Collection::Tasks, payload(json!({"title": "Pour slab"})))
            .await
            .record
            .unwrap();

        f.remote.fail(Operation::Update, FailureMode::ErrorShape);
        let outcome = f
            .crud
            .update(Collection::Tasks, created.identity(), payload(json!({"title": "x"})))
            .await;
        assert!(!outcome.success);
        assert_eq!(f.crud.list(Collection::Tasks).await, vec![created]);

        let missing = f
            .crud
            .update(Collection::Tasks, RecordId::Remote(RemoteId::new("nope")), Payload::new())
            .await;
        assert_eq!(missing.refusal, Some(Refusal::NotFound));
    }

    #[tokio::test]
    async fn test_delete_keeps_record_when_remote_throws() {
        let f = fixture(Some(SITE), true).await;
        let created = f
            .crud
            .create(Collection::Materials, payload(json!({"name": "Cement"})))
            .await
            .record
            .unwrap();

        f.remote.fail(Operation::Remove, FailureMode::Transport);
        let outcome = f.crud.delete(Collection::Materials, created.identity()).await;
        assert!(!outcome.success);
        assert_eq!(f.crud.list(Collection::Materials).await, vec![created.clone()]);

        // An error document still counts as a resolved call
        f.remote.fail(Operation::Remove, FailureMode::ErrorShape);
        let outcome = f.crud.delete(Collection::Materials, created.identity()).await;
        assert!(outcome.success);
        assert!(f.crud.list(Collection::Materials).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_saves_linked_settings_once() {
        let f = fixture(Some(SITE), true).await;
        f.crud
            .create(Collection::Materials, payload(json!({"name": "Cement", "unit": "bags"})))
            .await;
        f.crud
            .create(Collection::Materials, payload(json!({"name": "Cement", "unit": "kg"})))
            .await;

        assert_eq!(
            f.remote.settings(SITE),
            json!({"materialNames": ["Cement"], "units": ["bags", "kg"]})
        );
        assert_eq!(f.store.read().await.settings().units, vec!["bags", "kg"]);
        // Second create only changed units
        assert_eq!(f.remote.call_count(Operation::PatchSettings), 2);
    }

    #[tokio::test]
    async fn test_settings_failure_does_not_undo_create() {
        let f = fixture(Some(SITE), true).await;
        f.remote.fail(Operation::PatchSettings, FailureMode::Transport);
        let outcome = f
            .crud
            .create(Collection::Manpower, payload(json!({"trade": "Mason", "count": 4})))
            .await;
        assert!(outcome.success);
        assert_eq!(f.crud.list(Collection::Manpower).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_settings_patch_is_retried() {
        let f = fixture(Some(SITE), true).await;
        f.remote.fail(Operation::PatchSettings, FailureMode::Transport);
        let outcome = f.crud.add_setting_item(SettingsList::Trades, "Welder").await;
        assert!(!outcome.success);
        assert!(f.store.read().await.settings().trades.is_empty());

        f.remote.clear_failures();
        assert!(f.crud.add_setting_item(SettingsList::Trades, "Welder").await.success);
        assert_eq!(f.remote.call_count(Operation::PatchSettings), 2);
        assert_eq!(f.remote.settings(SITE), json!({"trades": ["Welder"]}));
        assert_eq!(f.store.read().await.settings().trades, vec!["Welder"]);
    }

    #[tokio::test]
    async fn test_failed_linked_settings_resent_on_next_create() {
        let f = fixture(Some(SITE), true).await;
        f.remote.fail(Operation::PatchSettings, FailureMode::Transport);
        f.crud
            .create(Collection::Manpower, payload(json!({"trade": "Mason", "count": 4})))
            .await;
        assert!(f.store.read().await.settings().trades.is_empty());

        f.remote.clear_failures();
        f.crud
            .create(Collection::Manpower, payload(json!({"trade": "Mason", "count": 2})))
            .await;
        assert_eq!(f.remote.settings(SITE), json!({"trades": ["Mason"]}));
    }

    #[tokio::test]
    async fn test_setting_items() {
        let f = fixture(Some(SITE), true).await;
        assert!(f.crud.add_setting_item(SettingsList::Trades, "Welder").await.success);
        assert!(f.crud.add_setting_item(SettingsList::Trades, "Welder").await.success);
        assert_eq!(f.remote.call_count(Operation::PatchSettings), 1);

        assert!(f.crud.remove_setting_item(SettingsList::Trades, "Welder").await.success);
        assert_eq!(f.remote.settings(SITE), json!({"trades": []}));

        let none = fixture(Some(PLACEHOLDER_ID), true).await;
        let outcome = none.crud.add_setting_item(SettingsList::Units, "kg").await;
        assert_eq!(outcome.refusal, Some(Refusal::NoActiveSite));
    }
}
