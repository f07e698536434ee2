//! In-process remote store.
//!
//! Behaves like the REST backend (assigns `_id`s, filters lists by scope,
//! merges partial settings updates) and can be told to fail specific
//! operations or hold their responses until released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use super::{ApiError, RemoteStore};
use crate::models::record::REMOTE_ID_FIELD;
use crate::models::{Collection, Payload, RemoteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Update,
    Remove,
    FetchSettings,
    PatchSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The call itself fails (network error).
    Transport,
    /// The call resolves with an `{ "message": .. }` error document.
    ErrorShape,
}

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    successes_left: usize,
    mode: FailureMode,
}

#[derive(Default)]
struct State {
    records: HashMap<Collection, Vec<Map<String, Value>>>,
    settings: HashMap<String, Map<String, Value>>,
    failures: HashMap<Operation, FailurePlan>,
    calls: Vec<(Operation, Option<Collection>)>,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    next_id: AtomicU64,
    gates: Mutex<HashMap<Operation, Arc<Semaphore>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the state from the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:024x}", 0x6500_0000_0000_0000_0000_0000u128 + n as u128)
    }

    /// Store records as if they already existed remotely.
    pub fn seed(&self, collection: Collection, values: Vec<Value>) {
        let mut state = lock(&self.state);
        for value in values {
            let Value::Object(mut map) = value else { continue };
            if !map.contains_key(REMOTE_ID_FIELD) {
                map.insert(REMOTE_ID_FIELD.to_string(), Value::from(self.new_id()));
            }
            state.records.entry(collection).or_default().push(map);
        }
    }

    pub fn seed_settings(&self, site_id: &str, settings: Value) {
        if let Value::Object(map) = settings {
            lock(&self.state).settings.insert(site_id.to_string(), map);
        }
    }

    pub fn records(&self, collection: Collection) -> Vec<Value> {
        lock(&self.state)
            .records
            .get(&collection)
            .map(|rs| rs.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn settings(&self, site_id: &str) -> Value {
        lock(&self.state)
            .settings
            .get(site_id)
            .cloned()
            .map(Value::Object)
            .unwrap_or_else(|| json!({}))
    }

    /// Fail every call to `op` from now on.
    pub fn fail(&self, op: Operation, mode: FailureMode) {
        self.fail_after(op, 0, mode);
    }

    /// Let `successes` calls to `op` through, then fail the rest.
    pub fn fail_after(&self, op: Operation, successes: usize, mode: FailureMode) {
        lock(&self.state).failures.insert(
            op,
            FailurePlan {
                successes_left: successes,
                mode,
            },
        );
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    pub fn call_count(&self, op: Operation) -> usize {
        lock(&self.state).calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn calls_for(&self, op: Operation, collection: Collection) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(o, c)| *o == op && *c == Some(collection))
            .count()
    }

    /// Make calls to `op` wait until `release` lets them through.
    pub fn hold(&self, op: Operation) {
        lock(&self.gates).insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: Operation, count: usize) {
        if let Some(gate) = lock(&self.gates).get(&op) {
            gate.add_permits(count);
        }
    }

    pub fn hold_lists(&self) {
        self.hold(Operation::List);
    }

    pub fn release_lists(&self, count: usize) {
        self.release(Operation::List, count);
    }

    async fn pass_gate(&self, op: Operation) {
        let gate = lock(&self.gates).get(&op).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    /// Record the call and decide whether it should fail.
    fn begin(&self, op: Operation, collection: Option<Collection>) -> Option<FailureMode> {
        let mut state = lock(&self.state);
        state.calls.push((op, collection));
        let plan = state.failures.get_mut(&op)?;
        if plan.successes_left > 0 {
            plan.successes_left -= 1;
            None
        } else {
            Some(plan.mode)
        }
    }

    fn failure(op: Operation, mode: FailureMode) -> Result<Value, ApiError> {
        match mode {
            FailureMode::Transport => Err(ApiError::Transport(format!("{:?} failed", op))),
            FailureMode::ErrorShape => Ok(json!({ "message": format!("{:?} rejected", op) })),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list(
        &self,
        _token: &str,
        collection: Collection,
        scope_id: Option<&str>,
    ) -> Result<Value, ApiError> {
        let failure = self.begin(Operation::List, Some(collection));
        let field = collection.scope_kind().payload_field();
        let snapshot: Vec<Value> = {
            let state = lock(&self.state);
            state
                .records
                .get(&collection)
                .map(|rs| {
                    rs.iter()
                        .filter(|r| match (field, scope_id) {
                            (Some(field), Some(id)) => {
                                r.get(field).and_then(Value::as_str) == Some(id)
                            }
                            _ => true,
                        })
                        .cloned()
                        .map(Value::Object)
                        .collect()
                })
                .unwrap_or_default()
        };

        self.pass_gate(Operation::List).await;

        match failure {
            Some(mode) => Self::failure(Operation::List, mode),
            None => Ok(Value::Array(snapshot)),
        }
    }

    async fn create(
        &self,
        _token: &str,
        collection: Collection,
        payload: &Payload,
    ) -> Result<Value, ApiError> {
        let failure = self.begin(Operation::Create, Some(collection));
        self.pass_gate(Operation::Create).await;
        if let Some(mode) = failure {
            return Self::failure(Operation::Create, mode);
        }
        let mut record = payload.clone();
        record.insert(REMOTE_ID_FIELD.to_string(), Value::from(self.new_id()));
        lock(&self.state)
            .records
            .entry(collection)
            .or_default()
            .push(record.clone());
        Ok(Value::Object(record))
    }

    async fn update(
        &self,
        _token: &str,
        collection: Collection,
        id: &RemoteId,
        payload: &Payload,
    ) -> Result<Value, ApiError> {
        if let Some(mode) = self.begin(Operation::Update, Some(collection)) {
            return Self::failure(Operation::Update, mode);
        }
        let mut state = lock(&self.state);
        let record = state
            .records
            .get_mut(&collection)
            .and_then(|rs| {
                rs.iter_mut()
                    .find(|r| r.get(REMOTE_ID_FIELD).and_then(Value::as_str) == Some(id.as_str()))
            })
            .ok_or_else(|| ApiError::NotFound(format!("{} {}", collection, id)))?;
        for (key, value) in payload {
            if key != REMOTE_ID_FIELD {
                record.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(record.clone()))
    }

    async fn remove(
        &self,
        _token: &str,
        collection: Collection,
        id: &RemoteId,
    ) -> Result<Value, ApiError> {
        let failure = self.begin(Operation::Remove, Some(collection));
        self.pass_gate(Operation::Remove).await;
        if let Some(mode) = failure {
            return Self::failure(Operation::Remove, mode);
        }
        let mut state = lock(&self.state);
        let Some(records) = state.records.get_mut(&collection) else {
            return Ok(json!({ "message": "Not found" }));
        };
        let before = records.len();
        records.retain(|r| r.get(REMOTE_ID_FIELD).and_then(Value::as_str) != Some(id.as_str()));
        Ok(json!({ "deleted": before - records.len() }))
    }

    async fn fetch_settings(&self, _token: &str, site_id: &str) -> Result<Value, ApiError> {
        if let Some(mode) = self.begin(Operation::FetchSettings, None) {
            return Self::failure(Operation::FetchSettings, mode);
        }
        Ok(self.settings(site_id))
    }

    async fn patch_settings(
        &self,
        _token: &str,
        site_id: &str,
        patch: &Payload,
    ) -> Result<Value, ApiError> {
        if let Some(mode) = self.begin(Operation::PatchSettings, None) {
            return Self::failure(Operation::PatchSettings, mode);
        }
        let mut state = lock(&self.state);
        let settings = state.settings.entry(site_id.to_string()).or_default();
        for (key, value) in patch {
            settings.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(settings.clone()))
    }
}
