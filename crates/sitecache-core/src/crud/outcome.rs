use serde::Serialize;
use thiserror::Error;

use crate::models::Record;
use crate::scope::ScopeKind;

/// Preconditions a mutation refused to proceed without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("Not signed in - please log in again")]
    NoSession,

    #[error("Select a site before adding records")]
    NoActiveSite,

    #[error("Select a company before adding records")]
    NoActiveCompany,

    #[error("Record not found")]
    NotFound,

    #[error("Record is still being saved - try again shortly")]
    PendingRecord,
}

impl Refusal {
    /// Refusal for a collection whose scope is missing or a placeholder.
    pub fn missing_scope(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Company => Refusal::NoActiveCompany,
            ScopeKind::Site | ScopeKind::Global => Refusal::NoActiveSite,
        }
    }
}

/// What every context-surface mutation returns: `{ success, message?, record? }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(skip)]
    pub refusal: Option<Refusal>,
}

impl MutationOutcome {
    pub fn succeeded(record: Record) -> Self {
        Self {
            success: true,
            message: None,
            record: Some(record),
            refusal: None,
        }
    }

    /// Success with nothing to hand back (settings list edits).
    pub fn done() -> Self {
        Self {
            success: true,
            message: None,
            record: None,
            refusal: None,
        }
    }

    pub fn refused(reason: Refusal) -> Self {
        Self {
            success: false,
            message: Some(reason.to_string()),
            record: None,
            refusal: Some(reason),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            record: None,
            refusal: None,
        }
    }

    pub fn is_refusal(&self) -> bool {
        self.refusal.is_some()
    }
}
