use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::backend::StorageBackend;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_display(&self) -> String {
        age_display(self.cached_at)
    }
}

/// Human readable age of a timestamp ("just now", "5m ago", "2h ago", "3d ago").
pub fn age_display(at: DateTime<Utc>) -> String {
    let minutes = (Utc::now() - at).num_minutes();
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Durable local key-value storage.
///
/// Reads fall back to a default and writes report success as a bool; no
/// failure is ever returned to the caller. In-memory state stays
/// authoritative when persistence fails.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Raw JSON value under `key`, or `None` if missing or unreadable.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let contents = match self.backend.read(key) {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read local storage");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Failed to parse local storage value");
                None
            }
        }
    }

    /// Typed value under `key`, or `default` if missing, unreadable or of the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(value) = self.get_value(key) else {
            return default;
        };
        match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(key, error = %e, "Stored value has unexpected shape, using default");
                default
            }
        }
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get(key, T::default())
    }

    /// Persist `value` under `key`. Returns false (after logging) on failure.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let contents = match serde_json::to_string(value) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize value for local storage");
                return false;
            }
        };
        match self.backend.write(key, &contents) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to write local storage");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.backend.delete(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to delete local storage key");
                false
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.backend.read(key), Ok(Some(_)))
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.backend.keys() {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
            Err(e) => {
                warn!(prefix, error = %e, "Failed to list local storage keys");
                Vec::new()
            }
        }
    }

    // ===== Snapshots =====

    pub fn load_snapshot<T: DeserializeOwned>(&self, key: &str) -> Option<CachedData<T>> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(cached) => Some(cached),
            Err(e) => {
                debug!(key, error = %e, "Ignoring malformed snapshot");
                None
            }
        }
    }

    pub fn save_snapshot<T: Serialize>(&self, key: &str, data: &T) -> bool {
        self.set(key, &CachedData::new(data))
    }
}
