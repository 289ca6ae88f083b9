//! Worker fleet status endpoint

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Serialize;

use warden_common::db::models::WorkerStatus;
use warden_common::db::worker_status;

use crate::error::ApiResult;
use crate::AppState;

/// One worker in the fleet listing
#[derive(Debug, Serialize)]
pub struct WorkerEntry {
    #[serde(flatten)]
    pub status: WorkerStatus,
    /// True when last_seen is older than the staleness threshold but the
    /// record has not yet expired: slow to report rather than gone.
    pub stale: bool,
}

/// GET /api/workers
///
/// Fleet listing. Dead workers disappear when their records expire;
/// live-but-slow workers are flagged stale.
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerEntry>>> {
    let policy = state.policy.get().await?;
    let threshold = Duration::seconds(policy.worker_staleness_threshold_secs);
    let now = Utc::now();

    let entries = worker_status::list_all(&state.db)
        .await?
        .into_iter()
        .map(|status| WorkerEntry {
            stale: now.signed_duration_since(status.last_seen) > threshold,
            status,
        })
        .collect();

    Ok(Json(entries))
}

/// Build worker status routes
pub fn worker_routes() -> Router<AppState> {
    Router::new().route("/api/workers", get(list_workers))
}
