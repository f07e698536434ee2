//! Per-collection create, update and delete.
//!
//! Each operation calls the remote store, then reconciles the collection
//! store with the confirmed result. Failures and refusals are returned as
//! `MutationOutcome` values for the caller to present.

pub mod facade;
pub mod outcome;

pub use facade::Crud;
pub use outcome::{MutationOutcome, Refusal};
