//! warden-review library - Review service
//!
//! Serves reviewer-facing HTTP endpoints: target selection, voting,
//! manual recheck requests, entity lookups, and worker fleet status.

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use warden_common::audit::ActivityLogger;
use warden_common::events::EventBus;
use warden_common::params::PolicyCache;

pub mod accountability;
pub mod api;
pub mod breaks;
pub mod consensus;
pub mod db;
pub mod error;
pub mod selector;

pub use crate::error::{ApiError, ApiResult};

use crate::breaks::BreakTracker;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Read-through cache over the settings table
    pub policy: Arc<PolicyCache>,
    /// Async activity trail writer
    pub activity: ActivityLogger,
    /// Per-reviewer break state machine
    pub breaks: Arc<BreakTracker>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        policy: Arc<PolicyCache>,
        activity: ActivityLogger,
    ) -> Self {
        Self {
            db,
            event_bus,
            policy,
            activity,
            breaks: Arc::new(BreakTracker::new()),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::review_routes())
        .merge(api::entity_routes())
        .merge(api::queue_routes())
        .merge(api::worker_routes())
        .merge(api::event_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
