use std::fmt;

use serde::{Deserialize, Serialize};

use super::settings::{SettingsLink, SettingsList};
use crate::scope::ScopeKind;

/// Every entity collection the cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Companies,
    Sites,
    CompanyUsers,
    ContactLists,
    ConcreteTests,
    SoilTests,
    SteelTests,
    BrickTests,
    Transactions,
    Materials,
    MaterialRequests,
    Checklists,
    Manpower,
    Bills,
    Inventory,
    Documents,
    Messages,
    Estimations,
    Tasks,
    Equipment,
    DailyReports,
    PurchaseOrders,
    Drawings,
    Issues,
    Attendance,
}

const MATERIAL_LINKS: &[SettingsLink] = &[
    SettingsLink { field: "name", list: SettingsList::MaterialNames },
    SettingsLink { field: "unit", list: SettingsList::Units },
];

const MATERIAL_REQUEST_LINKS: &[SettingsLink] = &[
    SettingsLink { field: "materialName", list: SettingsList::MaterialNames },
    SettingsLink { field: "unit", list: SettingsList::Units },
];

const MANPOWER_LINKS: &[SettingsLink] = &[SettingsLink { field: "trade", list: SettingsList::Trades }];

impl Collection {
    pub const ALL: [Collection; 25] = [
        Collection::Companies,
        Collection::Sites,
        Collection::CompanyUsers,
        Collection::ContactLists,
        Collection::ConcreteTests,
        Collection::SoilTests,
        Collection::SteelTests,
        Collection::BrickTests,
        Collection::Transactions,
        Collection::Materials,
        Collection::MaterialRequests,
        Collection::Checklists,
        Collection::Manpower,
        Collection::Bills,
        Collection::Inventory,
        Collection::Documents,
        Collection::Messages,
        Collection::Estimations,
        Collection::Tasks,
        Collection::Equipment,
        Collection::DailyReports,
        Collection::PurchaseOrders,
        Collection::Drawings,
        Collection::Issues,
        Collection::Attendance,
    ];

    /// Stable name used in storage keys.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Companies => "companies",
            Collection::Sites => "sites",
            Collection::CompanyUsers => "company_users",
            Collection::ContactLists => "contact_lists",
            Collection::ConcreteTests => "concrete_tests",
            Collection::SoilTests => "soil_tests",
            Collection::SteelTests => "steel_tests",
            Collection::BrickTests => "brick_tests",
            Collection::Transactions => "transactions",
            Collection::Materials => "materials",
            Collection::MaterialRequests => "material_requests",
            Collection::Checklists => "checklists",
            Collection::Manpower => "manpower",
            Collection::Bills => "bills",
            Collection::Inventory => "inventory",
            Collection::Documents => "documents",
            Collection::Messages => "messages",
            Collection::Estimations => "estimations",
            Collection::Tasks => "tasks",
            Collection::Equipment => "equipment",
            Collection::DailyReports => "daily_reports",
            Collection::PurchaseOrders => "purchase_orders",
            Collection::Drawings => "drawings",
            Collection::Issues => "issues",
            Collection::Attendance => "attendance",
        }
    }

    /// REST path segment (`concrete-tests`).
    pub fn endpoint(&self) -> String {
        self.name().replace('_', "-")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn scope_kind(&self) -> ScopeKind {
        match self {
            Collection::Companies => ScopeKind::Global,
            Collection::Sites | Collection::CompanyUsers | Collection::ContactLists => {
                ScopeKind::Company
            }
            _ => ScopeKind::Site,
        }
    }

    /// Collections that existed only in the local cache before remote
    /// persistence, and may still have legacy data to promote.
    pub fn is_legacy_migratable(&self) -> bool {
        matches!(
            self,
            Collection::ConcreteTests
                | Collection::SoilTests
                | Collection::SteelTests
                | Collection::BrickTests
                | Collection::Checklists
                | Collection::Estimations
                | Collection::Tasks
                | Collection::DailyReports
        )
    }

    /// Payload fields whose values feed the site settings aggregate.
    pub fn settings_links(&self) -> &'static [SettingsLink] {
        match self {
            Collection::Materials => MATERIAL_LINKS,
            Collection::MaterialRequests => MATERIAL_REQUEST_LINKS,
            Collection::Manpower => MANPOWER_LINKS,
            _ => &[],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
