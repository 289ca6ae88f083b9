//! Review flow endpoints: target selection and voting

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_common::db::models::{
    Entity, EntityKind, EntityStatus, ReviewAction, ReviewMode, SortBy, TargetMode,
};

use crate::consensus;
use crate::db::reviewers;
use crate::error::{ApiError, ApiResult};
use crate::selector::{self, SelectOutcome};
use crate::AppState;

/// POST /api/review/next request
#[derive(Debug, Deserialize)]
pub struct NextReviewRequest {
    pub reviewer_id: i64,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub target_mode: TargetMode,
    /// Requested review mode; non-privileged reviewers are always
    /// coerced to training.
    pub mode: Option<ReviewMode>,
}

/// POST /api/review/next response
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NextReviewResponse {
    /// Entity granted for review
    Target { entity: Entity, mode: ReviewMode },
    /// Reviewer must wait until the given time
    OnBreak { until: DateTime<Utc> },
    /// Backlog is empty under every fallback status
    None,
}

/// POST /api/review/next
///
/// Pick the next entity for a reviewer. Being on break or finding an
/// empty backlog are 200 outcomes; a banned reviewer gets 403.
pub async fn next_review(
    State(state): State<AppState>,
    Json(request): Json<NextReviewRequest>,
) -> ApiResult<Json<NextReviewResponse>> {
    let policy = state.policy.get().await?;
    let reviewer = reviewers::get_or_create(&state.db, request.reviewer_id).await?;
    if reviewer.banned {
        return Err(banned_error(&reviewer.ban_reason));
    }

    let outcome = selector::next_target(
        &state.db,
        &policy,
        &state.event_bus,
        &state.activity,
        &state.breaks,
        &reviewer,
        request.sort_by,
        request.target_mode,
    )
    .await?;

    let mode = consensus::effective_mode(reviewer.privileged, request.mode);
    match outcome {
        SelectOutcome::Target(entity) => Ok(Json(NextReviewResponse::Target { entity, mode })),
        SelectOutcome::OnBreak { until } => Ok(Json(NextReviewResponse::OnBreak { until })),
        SelectOutcome::Banned { reason } => Err(ApiError::Forbidden(reason)),
        SelectOutcome::Nothing => Ok(Json(NextReviewResponse::None)),
    }
}

/// POST /api/review/{kind}/{id}/vote request
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub reviewer_id: i64,
    /// confirm, clear, or skip
    pub action: ReviewAction,
    pub mode: Option<ReviewMode>,
}

/// POST /api/review/{kind}/{id}/vote response
#[derive(Debug, Serialize)]
pub struct VoteResponse {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub action: ReviewAction,
    pub mode: ReviewMode,
    pub status: EntityStatus,
    pub upvotes: i64,
    pub downvotes: i64,
    pub transitioned: bool,
}

/// POST /api/review/{kind}/{id}/vote
///
/// Apply a reviewer action. 409 when the consensus gate rejects a
/// standard-mode transition, 403 banned, 404 unknown entity.
pub async fn cast_vote(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(request): Json<VoteRequest>,
) -> ApiResult<Json<VoteResponse>> {
    let kind: EntityKind = kind.parse()?;
    if request.action == ReviewAction::Viewed {
        return Err(ApiError::BadRequest(
            "action must be confirm, clear, or skip".to_string(),
        ));
    }

    let policy = state.policy.get().await?;
    let reviewer = reviewers::get_or_create(&state.db, request.reviewer_id).await?;
    if reviewer.banned {
        return Err(banned_error(&reviewer.ban_reason));
    }

    let outcome = consensus::cast_vote(
        &state.db,
        &policy,
        &state.event_bus,
        &state.activity,
        &reviewer,
        id,
        kind,
        request.action,
        request.mode,
    )
    .await?;

    Ok(Json(VoteResponse {
        entity_id: outcome.entity.id,
        kind: outcome.entity.kind,
        action: request.action,
        mode: outcome.mode,
        status: outcome.entity.status,
        upvotes: outcome.entity.upvotes,
        downvotes: outcome.entity.downvotes,
        transitioned: outcome.transitioned,
    }))
}

fn banned_error(ban_reason: &Option<String>) -> ApiError {
    match ban_reason {
        Some(reason) => ApiError::Forbidden(format!("reviewer is banned: {}", reason)),
        None => ApiError::Forbidden("reviewer is banned".to_string()),
    }
}

/// Build review flow routes
pub fn review_routes() -> Router<AppState> {
    Router::new()
        .route("/api/review/next", post(next_review))
        .route("/api/review/:kind/:id/vote", post(cast_vote))
}
