//! # Warden Common Library
//!
//! Shared code for the Warden moderation services including:
//! - Database models and queries
//! - Event types (WardenEvent enum)
//! - Policy settings cache
//! - Asynchronous activity logging
//! - Configuration loading
//! - SSE utilities

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod params;
pub mod sse;

pub use error::{Error, Result};
