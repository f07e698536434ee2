//! Startup repair of corrupted local entries.
//!
//! Saved name lists sometimes hold strings that were spread into
//! index-keyed objects, and duplicate entries. Transaction snapshots and
//! legacy transaction caches can carry the same corruption in their
//! `category` and `partyName` fields.
//! Each key is rewritten only if something was actually fixed.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::{recover_indexed_string, Collection, NameList};
use crate::storage::keys::legacy_prefix;
use crate::storage::LocalStore;

/// Transaction fields that must hold plain strings.
const TRANSACTION_STRING_FIELDS: &[&str] = &["category", "partyName"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub keys_rewritten: Vec<String>,
    pub entries_coerced: usize,
    pub duplicates_removed: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.keys_rewritten.is_empty()
    }
}

/// Repair every saved name list, transaction snapshot and legacy transaction cache.
pub fn run(local: &LocalStore) -> RepairReport {
    let mut report = RepairReport::default();

    for list in NameList::ALL {
        repair_key(local, list.storage_key(), &mut report, repair_name_list);
    }
    for key in local.keys_with_prefix(&format!("{}_", Collection::Transactions.name())) {
        repair_snapshot_key(local, &key, &mut report, repair_transactions);
    }
    for key in local.keys_with_prefix(&legacy_prefix(Collection::Transactions.name())) {
        repair_key(local, &key, &mut report, repair_transactions);
    }

    if report.is_clean() {
        debug!("Local storage repair found nothing to fix");
    } else {
        info!(
            keys = report.keys_rewritten.len(),
            coerced = report.entries_coerced,
            duplicates = report.duplicates_removed,
            "Repaired local storage"
        );
    }
    report
}

fn repair_key(
    local: &LocalStore,
    key: &str,
    report: &mut RepairReport,
    repair: fn(&mut Vec<Value>, &mut RepairReport) -> bool,
) {
    let Some(Value::Array(mut entries)) = local.get_value(key) else {
        return;
    };
    if repair(&mut entries, report) && local.set(key, &entries) {
        report.keys_rewritten.push(key.to_string());
    }
}

/// Same as `repair_key`, for the `data` array of a `{data, cached_at}` snapshot.
fn repair_snapshot_key(
    local: &LocalStore,
    key: &str,
    report: &mut RepairReport,
    repair: fn(&mut Vec<Value>, &mut RepairReport) -> bool,
) {
    let Some(mut snapshot) = local.get_value(key) else {
        return;
    };
    let Some(Value::Array(entries)) = snapshot.get_mut("data") else {
        return;
    };
    if repair(entries, report) && local.set(key, &snapshot) {
        report.keys_rewritten.push(key.to_string());
    }
}

/// Coerce index-keyed objects back to strings, then drop repeated strings
/// keeping the first occurrence.
fn repair_name_list(entries: &mut Vec<Value>, report: &mut RepairReport) -> bool {
    let mut changed = false;
    for entry in entries.iter_mut() {
        if let Some(text) = recover_indexed_string(entry) {
            *entry = Value::String(text);
            report.entries_coerced += 1;
            changed = true;
        }
    }

    let mut seen: Vec<String> = Vec::new();
    let before = entries.len();
    entries.retain(|entry| match entry {
        Value::String(s) if seen.contains(s) => false,
        Value::String(s) => {
            seen.push(s.clone());
            true
        }
        _ => true,
    });
    let removed = before - entries.len();
    report.duplicates_removed += removed;
    changed || removed > 0
}

fn repair_transactions(entries: &mut Vec<Value>, report: &mut RepairReport) -> bool {
    let mut changed = false;
    for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
        for field in TRANSACTION_STRING_FIELDS {
            let Some(value) = entry.get_mut(*field) else {
                continue;
            };
            if let Some(text) = recover_indexed_string(value) {
                *value = Value::String(text);
                report.entries_coerced += 1;
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn local() -> (Arc<MemoryBackend>, LocalStore) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), LocalStore::new(backend))
    }

    #[test]
    fn test_duplicates_removed_in_first_occurrence_order() {
        let (_, local) = local();
        local.set("saved_parties", &json!(["A", "B", "A"]));

        let report = run(&local);
        assert_eq!(local.get_value("saved_parties"), Some(json!(["A", "B"])));
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.keys_rewritten, vec!["saved_parties"]);
    }

    #[test]
    fn test_indexed_objects_are_coerced() {
        let (_, local) = local();
        local.set(
            "saved_suppliers",
            &json!([{"0": "A", "1": "c", "2": "m", "3": "e"}, "Acme", {"name": "Bolt", "phone": "1"}]),
        );

        let report = run(&local);
        assert_eq!(
            local.get_value("saved_suppliers"),
            Some(json!(["Acme", {"name": "Bolt", "phone": "1"}]))
        );
        assert_eq!(report.entries_coerced, 1);
        assert_eq!(report.duplicates_removed, 1);
    }

    #[test]
    fn test_transaction_fields_are_coerced() {
        let (_, local) = local();
        let key = "vini_transactions_64b7f0c2a1e4d3b2c1a09f8e";
        local.set(
            key,
            &json!([
                {"amount": 5, "category": {"0": "F", "1": "u", "2": "e", "3": "l"}, "partyName": "Ram"},
                {"amount": 7, "category": "Food", "partyName": {"1": "i", "0": "H"}}
            ]),
        );

        let report = run(&local);
        assert_eq!(
            local.get_value(key),
            Some(json!([
                {"amount": 5, "category": "Fuel", "partyName": "Ram"},
                {"amount": 7, "category": "Food", "partyName": "Hi"}
            ]))
        );
        assert_eq!(report.entries_coerced, 2);
    }

    #[test]
    fn test_transaction_snapshot_fields_are_coerced() {
        let (_, local) = local();
        let key = "transactions_64b7f0c2a1e4d3b2c1a09f8e";
        local.save_snapshot(
            key,
            &json!([{"_id": "t1", "category": {"0": "F", "1": "o", "2": "o", "3": "d"}}]),
        );

        let report = run(&local);
        assert_eq!(report.keys_rewritten, vec![key]);
        let cached = local.load_snapshot::<Vec<Value>>(key).unwrap();
        assert_eq!(cached.data, vec![json!({"_id": "t1", "category": "Food"})]);
    }

    #[test]
    fn test_clean_data_is_not_rewritten() {
        let (backend, local) = local();
        local.set("saved_categories", &json!(["Fuel", "Food"]));
        let before = backend.read("saved_categories").unwrap();

        let report = run(&local);
        assert!(report.is_clean());
        assert_eq!(backend.read("saved_categories").unwrap(), before);
    }
}
