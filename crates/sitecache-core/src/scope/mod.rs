//! Tenant scope tracking.
//!
//! This module provides the `ScopeResolver`, which holds the active
//! company and site identifiers and notifies observers when they change.
//!
//! Only identifiers in the remote store's object-id format (24 hex
//! characters) are ever sent to the remote store. Anything else, including
//! the bootstrap placeholder `"1"`, is a local-only value.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Placeholder site id used before a real site has been created remotely.
pub const PLACEHOLDER_ID: &str = "1";

/// Length of a remote object id (12 bytes, hex encoded).
const OBJECT_ID_LEN: usize = 24;

/// Check whether a string is a remote-store object id.
pub fn is_object_id(s: &str) -> bool {
    s.len() == OBJECT_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A company or site identifier, possibly a local-only placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this id may be sent to the remote store as a scope qualifier.
    pub fn is_remote_valid(&self) -> bool {
        is_object_id(&self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Which part of the tenant scope a collection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Company,
    Site,
}

impl ScopeKind {
    /// Payload field that carries the scope qualifier, if any.
    pub fn payload_field(&self) -> Option<&'static str> {
        match self {
            ScopeKind::Global => None,
            ScopeKind::Company => Some("companyId"),
            ScopeKind::Site => Some("siteId"),
        }
    }
}

/// The active (company, site) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    pub company_id: Option<ScopeId>,
    pub site_id: Option<ScopeId>,
}

impl TenantScope {
    /// The site id, only if it is a valid remote identifier.
    pub fn remote_site(&self) -> Option<&ScopeId> {
        self.site_id.as_ref().filter(|id| id.is_remote_valid())
    }

    /// The company id, only if it is a valid remote identifier.
    pub fn remote_company(&self) -> Option<&ScopeId> {
        self.company_id.as_ref().filter(|id| id.is_remote_valid())
    }

    /// Remote-valid qualifier for a collection of the given kind.
    ///
    /// Returns `Ok(None)` for global collections and `Err(kind)` when the
    /// required scope is missing or still a placeholder.
    pub fn qualifier(&self, kind: ScopeKind) -> Result<Option<&ScopeId>, ScopeKind> {
        match kind {
            ScopeKind::Global => Ok(None),
            ScopeKind::Company => self.remote_company().map(Some).ok_or(kind),
            ScopeKind::Site => self.remote_site().map(Some).ok_or(kind),
        }
    }
}

/// Monotonic counters bumped whenever the matching part of the scope changes.
///
/// Work issued under one generation is discarded if the counter has moved
/// on by the time the work completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeGenerations {
    pub session: u64,
    pub company: u64,
    pub site: u64,
}

impl ScopeGenerations {
    pub fn for_kind(&self, kind: ScopeKind) -> u64 {
        match kind {
            ScopeKind::Global => self.session,
            ScopeKind::Company => self.company,
            ScopeKind::Site => self.site,
        }
    }
}

/// Scope plus the generations it was published under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSnapshot {
    pub scope: TenantScope,
    pub generations: ScopeGenerations,
}

/// Holds the active tenant scope.
///
/// Mutations publish a new `ScopeSnapshot` to every subscriber. `current()`
/// always reads the latest value, so tasks that started before a switch can
/// check what is active now instead of what was captured when they began.
pub struct ScopeResolver {
    tx: watch::Sender<ScopeSnapshot>,
}

impl Default for ScopeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeResolver {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ScopeSnapshot::default());
        Self { tx }
    }

    /// Latest scope and generations.
    pub fn current(&self) -> ScopeSnapshot {
        self.tx.borrow().clone()
    }

    pub fn scope(&self) -> TenantScope {
        self.tx.borrow().scope.clone()
    }

    pub fn generations(&self) -> ScopeGenerations {
        self.tx.borrow().generations
    }

    /// Receiver that observes every scope mutation.
    pub fn subscribe(&self) -> watch::Receiver<ScopeSnapshot> {
        self.tx.subscribe()
    }

    /// Switch the active site. Returns the new snapshot if anything changed.
    pub fn set_site(&self, site: Option<ScopeId>) -> Option<ScopeSnapshot> {
        let mut changed = false;
        self.tx.send_if_modified(|snap| {
            if snap.scope.site_id == site {
                return false;
            }
            snap.scope.site_id = site.clone();
            snap.generations.site += 1;
            changed = true;
            true
        });
        if changed {
            debug!(site = ?site, "Active site changed");
            Some(self.current())
        } else {
            None
        }
    }

    /// Switch the active company. The site is always cleared because there is
    /// no guarantee the previous site belongs to the new company.
    pub fn set_company(&self, company: Option<ScopeId>) -> Option<ScopeSnapshot> {
        let mut changed = false;
        self.tx.send_if_modified(|snap| {
            if snap.scope.company_id == company {
                return false;
            }
            snap.scope.company_id = company.clone();
            snap.generations.company += 1;
            snap.scope.site_id = None;
            snap.generations.site += 1;
            changed = true;
            true
        });
        if changed {
            debug!(company = ?company, "Active company changed, site cleared");
            Some(self.current())
        } else {
            None
        }
    }

    /// Drop both scope ids and invalidate everything issued so far.
    pub fn end_session(&self) -> ScopeSnapshot {
        self.tx.send_modify(|snap| {
            snap.scope = TenantScope::default();
            snap.generations.session += 1;
            snap.generations.company += 1;
            snap.generations.site += 1;
        });
        self.current()
    }
}
