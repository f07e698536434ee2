//! Session state consumed from the auth collaborator.
//!
//! Login, logout and signup happen elsewhere; the cache is handed a
//! `CurrentUser` and reads nothing but its bearer token.

pub mod session;

use std::sync::Arc;

use tokio::sync::RwLock;

pub use session::{CurrentUser, Session, SessionData};

pub type SharedSession = Arc<RwLock<Session>>;
