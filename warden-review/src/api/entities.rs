//! Entity lookup endpoints

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use warden_common::db::entities;
use warden_common::db::models::{Entity, EntityKind};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// GET /api/entities/{kind}/{id}
///
/// Full entity detail: reasons, confidence, vote counters, timestamps.
pub async fn get_entity_detail(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<Json<Entity>> {
    let kind: EntityKind = kind.parse()?;
    let entity = entities::get_entity(&state.db, id, kind)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {}/{} not found", kind, id)))?;
    Ok(Json(entity))
}

/// GET /api/entities/{kind}/{id}/votes response
#[derive(Debug, Serialize)]
pub struct VoteStatsResponse {
    pub upvotes: i64,
    pub downvotes: i64,
    pub total: i64,
    /// Share of votes saying "safe"; 0.0 when unvoted
    pub up_share: f64,
}

/// GET /api/entities/{kind}/{id}/votes
///
/// Read-only vote statistics.
pub async fn get_vote_stats(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> ApiResult<Json<VoteStatsResponse>> {
    let kind: EntityKind = kind.parse()?;
    let entity = entities::get_entity(&state.db, id, kind)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {}/{} not found", kind, id)))?;

    let total = entity.total_votes();
    let up_share = if total > 0 { entity.upvotes as f64 / total as f64 } else { 0.0 };

    Ok(Json(VoteStatsResponse {
        upvotes: entity.upvotes,
        downvotes: entity.downvotes,
        total,
        up_share,
    }))
}

/// Build entity lookup routes
pub fn entity_routes() -> Router<AppState> {
    Router::new()
        .route("/api/entities/:kind/:id", get(get_entity_detail))
        .route("/api/entities/:kind/:id/votes", get(get_vote_stats))
}
