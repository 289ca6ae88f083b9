//! Manual recheck queue endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use warden_common::db::entities;
use warden_common::db::models::{EntityKind, QueuePriority, ReviewMode};
use warden_common::db::queue;
use warden_common::events::WardenEvent;

use crate::consensus::effective_mode;
use crate::db::reviewers;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// POST /api/queue request
#[derive(Debug, Deserialize)]
pub struct QueueRecheckRequest {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub reviewer_id: i64,
    pub reason: Option<String>,
}

/// POST /api/queue response
#[derive(Debug, Serialize)]
pub struct QueueRecheckResponse {
    pub priority: QueuePriority,
    /// 1-based position among pending items of the same priority
    pub position: i64,
    pub lengths: queue::QueueLengths,
}

/// POST /api/queue
///
/// Request a manual rescan of an entity. Privileged (standard-mode)
/// requesters get High priority, training-mode requesters Low. 202 on
/// acceptance, 409 when the entity is already queued, 404 unknown entity.
pub async fn queue_recheck(
    State(state): State<AppState>,
    Json(request): Json<QueueRecheckRequest>,
) -> ApiResult<(StatusCode, Json<QueueRecheckResponse>)> {
    if entities::get_entity(&state.db, request.entity_id, request.kind).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "entity {}/{} not found",
            request.kind, request.entity_id
        )));
    }

    let reviewer = reviewers::get_or_create(&state.db, request.reviewer_id).await?;
    let priority = match effective_mode(reviewer.privileged, None) {
        ReviewMode::Standard => QueuePriority::High,
        ReviewMode::Training => QueuePriority::Low,
    };

    let added_by = format!("reviewer:{}", request.reviewer_id);
    let enqueue_req = queue::EnqueueRequest {
        entity_id: request.entity_id,
        entity_kind: request.kind,
        priority,
        reason: request.reason.unwrap_or_else(|| "manual recheck".to_string()),
        added_by: added_by.clone(),
    };
    queue::enqueue(&state.db, &enqueue_req, true).await?;

    let info = queue::queue_info(&state.db, request.entity_id, request.kind)
        .await?
        .ok_or_else(|| ApiError::Internal("queued item vanished".to_string()))?;
    let lengths = queue::lengths(&state.db).await?;

    info!(
        entity_id = request.entity_id,
        kind = %request.kind,
        priority = %priority,
        "Recheck queued by {}", added_by
    );
    state.event_bus.emit_lossy(WardenEvent::RecheckQueued {
        entity_id: request.entity_id,
        entity_kind: request.kind,
        priority,
        added_by: added_by.clone(),
        timestamp: Utc::now(),
    });
    state.activity.log_entity(
        added_by,
        "queue_recheck",
        request.entity_id,
        request.kind,
        Some(format!("{} priority", priority)),
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(QueueRecheckResponse { priority, position: info.position, lengths }),
    ))
}

/// GET /api/queue/{kind}/{id}
///
/// Queue state for one entity. 404 when it was never queued.
pub async fn get_queue_info(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<Json<queue::QueueInfo>> {
    let kind: EntityKind = kind.parse()?;
    let info = queue::queue_info(&state.db, id, kind)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {}/{} was never queued", kind, id)))?;
    Ok(Json(info))
}

/// GET /api/queue/depth
///
/// Pending counts per priority.
pub async fn queue_depth(State(state): State<AppState>) -> ApiResult<Json<queue::QueueLengths>> {
    Ok(Json(queue::lengths(&state.db).await?))
}

/// Build queue routes
pub fn queue_routes() -> Router<AppState> {
    Router::new()
        .route("/api/queue", post(queue_recheck))
        .route("/api/queue/depth", get(queue_depth))
        .route("/api/queue/:kind/:id", get(get_queue_info))
}
