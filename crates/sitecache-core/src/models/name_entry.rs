//! Saved free-text reference lists (suppliers, parties, categories).
//!
//! On disk an entry is either a plain string or an object with a `name`
//! field. In memory it is a `NameEntry`, so callers never inspect JSON types
//! to find the display name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A saved list stored under a global key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameList {
    Suppliers,
    Parties,
    Categories,
}

impl NameList {
    pub const ALL: [NameList; 3] = [NameList::Suppliers, NameList::Parties, NameList::Categories];

    pub fn storage_key(&self) -> &'static str {
        match self {
            NameList::Suppliers => "saved_suppliers",
            NameList::Parties => "saved_parties",
            NameList::Categories => "saved_categories",
        }
    }
}

/// An entry that is a full object rather than a bare name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEntity {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NameEntry {
    Name(String),
    Record(NamedEntity),
}

impl NameEntry {
    pub fn display_name(&self) -> &str {
        match self {
            NameEntry::Name(name) => name,
            NameEntry::Record(entity) => &entity.name,
        }
    }

    /// Read a stored entry, recovering strings that were saved as
    /// index-keyed objects. Anything without a usable name is dropped.
    pub fn from_stored(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(NameEntry::Name(s.clone())),
            Value::Object(map) => {
                if let Some(name) = map.get("name").and_then(Value::as_str) {
                    let mut extra = map.clone();
                    extra.remove("name");
                    return Some(NameEntry::Record(NamedEntity {
                        name: name.to_string(),
                        extra,
                    }));
                }
                recover_indexed_string(value).map(NameEntry::Name)
            }
            _ => None,
        }
    }

    /// The on-disk shape.
    pub fn to_stored(&self) -> Value {
        match self {
            NameEntry::Name(name) => Value::String(name.clone()),
            NameEntry::Record(entity) => {
                let mut map = entity.extra.clone();
                map.insert("name".to_string(), Value::String(entity.name.clone()));
                Value::Object(map)
            }
        }
    }
}

/// Rebuild a string that was spread into an object keyed by character
/// position (`{"0":"A","1":"c"}` -> `"Ac"`).
///
/// Returns `None` unless the value is a non-empty object whose keys are all
/// non-negative integers.
pub fn recover_indexed_string(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    if map.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(map.len());
    for (key, member) in map {
        let index: u64 = key.parse().ok()?;
        parts.push((index, member));
    }
    parts.sort_by_key(|(index, _)| *index);
    Some(
        parts
            .into_iter()
            .map(|(_, member)| match member {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}
