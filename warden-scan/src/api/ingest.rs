//! Detector ingest endpoints
//!
//! Detectors push two things: full entity snapshots (creation and
//! identity refresh) and individual findings, which are merged into the
//! entity's reasons map without disturbing other detectors' lines.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use warden_common::db::entities::{self, EntitySnapshot};
use warden_common::db::models::{Entity, EntityKind, Reason, ReasonType};
use warden_common::events::WardenEvent;

use crate::error::{ApiError, ApiResult};
use crate::evidence;
use crate::AppState;

/// POST /api/ingest/entity request
#[derive(Debug, Deserialize)]
pub struct EntityIngestRequest {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub account_created_at: DateTime<Utc>,
    /// Group ids a user belongs to; ignored for groups
    #[serde(default)]
    pub groups: Vec<i64>,
}

/// POST /api/ingest/entity
///
/// Create or refresh an entity from a detector snapshot. New entities
/// start Flagged with an empty reasons map; existing rows only have
/// their identity fields updated.
pub async fn ingest_entity(
    State(state): State<AppState>,
    Json(request): Json<EntityIngestRequest>,
) -> ApiResult<Json<Entity>> {
    let snapshot = EntitySnapshot {
        id: request.id,
        kind: request.kind,
        name: request.name,
        account_created_at: request.account_created_at,
        groups: request.groups,
    };
    let entity = entities::upsert_snapshot(&state.db, &snapshot).await?;

    debug!(
        entity_id = entity.id,
        kind = %entity.kind,
        status = %entity.status,
        "Entity snapshot ingested"
    );

    Ok(Json(entity))
}

/// POST /api/ingest/detection request
#[derive(Debug, Deserialize)]
pub struct DetectionIngestRequest {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub reason_type: ReasonType,
    pub message: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Detector submitting the finding
    pub source: String,
}

/// POST /api/ingest/detection response
#[derive(Debug, Serialize)]
pub struct DetectionIngestResponse {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub reason_type: ReasonType,
    /// The composite message for this reason type after the merge
    pub message: String,
    /// Aggregate entity confidence after the merge
    pub confidence: f64,
}

/// POST /api/ingest/detection
///
/// Merge one detector finding into an entity's reasons. 404 for an
/// unknown entity, 400 for a confidence outside [0,1] or a blank source.
pub async fn ingest_detection(
    State(state): State<AppState>,
    Json(request): Json<DetectionIngestRequest>,
) -> ApiResult<Json<DetectionIngestResponse>> {
    if !(0.0..=1.0).contains(&request.confidence) {
        return Err(ApiError::BadRequest(format!(
            "confidence must be within [0, 1], got {}",
            request.confidence
        )));
    }
    let source = request.source.trim();
    if source.is_empty() {
        return Err(ApiError::BadRequest("source must not be blank".to_string()));
    }

    let incoming = Reason {
        message: request.message,
        confidence: request.confidence,
        evidence: request.evidence,
    };
    let entity = entities::update_reasons(&state.db, request.entity_id, request.kind, |reasons| {
        evidence::merge(reasons, request.reason_type, &incoming, source);
    })
    .await?;

    let message = entity
        .reasons
        .get(&request.reason_type)
        .map(|r| r.message.clone())
        .unwrap_or_default();

    info!(
        entity_id = entity.id,
        kind = %entity.kind,
        reason_type = %request.reason_type,
        source,
        confidence = entity.confidence,
        "Merged detector finding"
    );
    state.event_bus.emit_lossy(WardenEvent::ReasonMerged {
        entity_id: entity.id,
        entity_kind: entity.kind,
        reason_type: request.reason_type,
        source: source.to_string(),
        confidence: entity.confidence,
        timestamp: Utc::now(),
    });

    Ok(Json(DetectionIngestResponse {
        entity_id: entity.id,
        kind: entity.kind,
        reason_type: request.reason_type,
        message,
        confidence: entity.confidence,
    }))
}

/// Build ingest routes
pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/api/ingest/entity", post(ingest_entity))
        .route("/api/ingest/detection", post(ingest_detection))
}
