//! Database access layer
//!
//! All timestamps are stored as INTEGER unix milliseconds; models expose
//! `chrono::DateTime<Utc>` and the helpers here convert at the boundary.

pub mod entities;
pub mod init;
pub mod models;
pub mod processing_log;
pub mod queue;
pub mod retry;
pub mod worker_status;

pub use init::init_database;

use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Convert a model timestamp to its storage representation.
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert a stored millisecond timestamp back to a model timestamp.
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Internal(format!("timestamp out of range: {}", ms)))
}

/// Convert an optional stored timestamp.
pub fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}
