//! Review-service database access
//!
//! Queries owned by the reviewer-facing flows: candidate selection,
//! review history, and reviewer profiles. Entity and queue access comes
//! from warden-common.

pub mod candidates;
pub mod history;
pub mod reviewers;
