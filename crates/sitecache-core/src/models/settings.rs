use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named lists in the per-site settings aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingsList {
    Trades,
    MaterialNames,
    Units,
}

impl SettingsList {
    /// Field name in the remote settings document.
    pub fn field(&self) -> &'static str {
        match self {
            SettingsList::Trades => "trades",
            SettingsList::MaterialNames => "materialNames",
            SettingsList::Units => "units",
        }
    }
}

/// Ties a record payload field to the settings list its values are saved into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsLink {
    pub field: &'static str,
    pub list: SettingsList,
}

/// Site-scoped settings aggregate (saved trades, material names, units).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSettings {
    #[serde(default)]
    pub trades: Vec<String>,
    #[serde(default)]
    pub material_names: Vec<String>,
    #[serde(default)]
    pub units: Vec<String>,
}

impl SiteSettings {
    pub fn list(&self, list: SettingsList) -> &[String] {
        match list {
            SettingsList::Trades => &self.trades,
            SettingsList::MaterialNames => &self.material_names,
            SettingsList::Units => &self.units,
        }
    }

    fn list_mut(&mut self, list: SettingsList) -> &mut Vec<String> {
        match list {
            SettingsList::Trades => &mut self.trades,
            SettingsList::MaterialNames => &mut self.material_names,
            SettingsList::Units => &mut self.units,
        }
    }

    /// Append `item` unless an exact (case-sensitive) match exists or it is blank.
    /// Returns true if the list changed.
    pub fn add(&mut self, list: SettingsList, item: &str) -> bool {
        if item.trim().is_empty() {
            return false;
        }
        let items = self.list_mut(list);
        if items.iter().any(|existing| existing == item) {
            return false;
        }
        items.push(item.to_string());
        true
    }

    /// Remove every exact match of `item`. Returns true if the list changed.
    pub fn remove(&mut self, list: SettingsList, item: &str) -> bool {
        let items = self.list_mut(list);
        let before = items.len();
        items.retain(|existing| existing != item);
        items.len() != before
    }

    /// Copy `lists` from `other`, leaving the remaining lists untouched.
    pub fn take_lists(&mut self, other: &SiteSettings, lists: &[SettingsList]) {
        for list in lists {
            *self.list_mut(*list) = other.list(*list).to_vec();
        }
    }

    /// Partial update document carrying only `lists`.
    pub fn patch_for(&self, lists: &[SettingsList]) -> Map<String, Value> {
        let mut patch = Map::new();
        for list in lists {
            patch.insert(
                list.field().to_string(),
                Value::from(self.list(*list).to_vec()),
            );
        }
        patch
    }
}
