use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The signed-in user as supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub user_id: String,
    pub role: String,
    pub bearer_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub user: CurrentUser,
    pub started_at: DateTime<Utc>,
}

/// Holds the current user for the lifetime of a session.
///
/// The cache only ever reads the bearer token; issuing, refreshing and
/// revoking it belong to the auth collaborator.
#[derive(Debug, Default)]
pub struct Session {
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, user: CurrentUser) {
        self.data = Some(SessionData {
            user,
            started_at: Utc::now(),
        });
    }

    /// Clear session data
    pub fn clear(&mut self) {
        self.data = None;
    }

    /// Get the bearer token if a user is signed in
    pub fn token(&self) -> Option<&str> {
        self.data
            .as_ref()
            .map(|d| d.user.bearer_token.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn user(&self) -> Option<&CurrentUser> {
        self.data.as_ref().map(|d| &d.user)
    }

    pub fn is_active(&self) -> bool {
        self.token().is_some()
    }
}
