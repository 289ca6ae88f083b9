//! Vote consensus arbiter
//!
//! Counter convention: upvotes are votes saying "safe", downvotes are
//! votes saying "harmful". Training-mode votes only move the counters;
//! Standard-mode votes transition entity status, gated so a single
//! reviewer cannot override strong crowd consensus.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use warden_common::audit::ActivityLogger;
use warden_common::db::entities::{
    get_entity, increment_votes, remove_memberships, set_status,
};
use warden_common::db::models::{
    Entity, EntityKind, EntityStatus, ReviewAction, ReviewMode, ReviewerProfile,
};
use warden_common::events::{EventBus, WardenEvent};
use warden_common::params::Policy;
use warden_common::{Error, Result};

use crate::db::history;

/// Result of a processed vote
#[derive(Debug)]
pub struct VoteOutcome {
    pub entity: Entity,
    pub mode: ReviewMode,
    pub transitioned: bool,
}

/// Mode applied to one action: Training is forced for non-privileged
/// reviewers; privileged reviewers default to Standard but may opt into
/// Training.
pub fn effective_mode(privileged: bool, requested: Option<ReviewMode>) -> ReviewMode {
    if !privileged {
        ReviewMode::Training
    } else {
        requested.unwrap_or(ReviewMode::Standard)
    }
}

/// The consensus gate: Some(reason) when the action must be rejected.
///
/// Blocks when the entity has at least `minimum_votes_required` votes and
/// the share opposing this action meets `vote_consensus_threshold`.
/// Confirm is opposed by "safe" votes (upvotes), Clear by "harmful"
/// votes (downvotes).
pub fn consensus_blocks(
    action: ReviewAction,
    upvotes: i64,
    downvotes: i64,
    policy: &Policy,
) -> Option<String> {
    let total = upvotes + downvotes;
    if total < policy.minimum_votes_required {
        return None;
    }

    let (opposing, direction) = match action {
        ReviewAction::Confirm => (upvotes, "safe"),
        ReviewAction::Clear => (downvotes, "harmful"),
        _ => return None,
    };

    let share = opposing as f64 / total as f64;
    if share >= policy.vote_consensus_threshold {
        return Some(format!(
            "cannot {}: {:.0}% of {} votes indicate {}",
            action,
            share * 100.0,
            total,
            direction
        ));
    }

    None
}

/// Apply one reviewer action to an entity.
///
/// Skip only records history. Training votes move the reputation counters
/// with atomic increments. Standard votes pass the consensus gate and then
/// transition status; Clear additionally drops group-membership rows.
pub async fn cast_vote(
    pool: &SqlitePool,
    policy: &Policy,
    event_bus: &EventBus,
    activity: &ActivityLogger,
    reviewer: &ReviewerProfile,
    entity_id: i64,
    kind: EntityKind,
    action: ReviewAction,
    requested_mode: Option<ReviewMode>,
) -> Result<VoteOutcome> {
    let mode = effective_mode(reviewer.privileged, requested_mode);
    let actor = format!("reviewer:{}", reviewer.reviewer_id);

    let entity = get_entity(pool, entity_id, kind)
        .await?
        .ok_or_else(|| Error::NotFound(format!("entity {}/{} not found", kind, entity_id)))?;

    if action == ReviewAction::Skip {
        history::record(pool, reviewer.reviewer_id, entity_id, kind, action).await?;
        activity.log_entity(actor, "review_skip", entity_id, kind, None);
        return Ok(VoteOutcome { entity, mode, transitioned: false });
    }

    match mode {
        ReviewMode::Training => {
            // Confirm agrees the entity is harmful, clear says it is safe
            let (up_delta, down_delta) = match action {
                ReviewAction::Confirm => (0, 1),
                ReviewAction::Clear => (1, 0),
                _ => return Err(Error::InvalidInput(format!("not a vote action: {}", action))),
            };

            let (upvotes, downvotes) =
                increment_votes(pool, entity_id, kind, up_delta, down_delta).await?;
            history::record(pool, reviewer.reviewer_id, entity_id, kind, action).await?;

            event_bus.emit_lossy(WardenEvent::VoteCast {
                entity_id,
                entity_kind: kind,
                reviewer_id: reviewer.reviewer_id,
                action,
                mode,
                upvotes,
                downvotes,
                timestamp: Utc::now(),
            });
            activity.log_entity(
                actor,
                format!("vote_{}", action),
                entity_id,
                kind,
                Some(format!("training, counters {}up/{}down", upvotes, downvotes)),
            );

            let entity = get_entity(pool, entity_id, kind)
                .await?
                .ok_or_else(|| Error::Internal(format!("entity {}/{} vanished", kind, entity_id)))?;
            Ok(VoteOutcome { entity, mode, transitioned: false })
        }

        ReviewMode::Standard => {
            let new_status = match action {
                ReviewAction::Confirm => EntityStatus::Confirmed,
                ReviewAction::Clear => EntityStatus::Cleared,
                _ => return Err(Error::InvalidInput(format!("not a vote action: {}", action))),
            };

            if let Some(reason) =
                consensus_blocks(action, entity.upvotes, entity.downvotes, policy)
            {
                event_bus.emit_lossy(WardenEvent::ConsensusBlocked {
                    entity_id,
                    entity_kind: kind,
                    attempted: new_status,
                    upvotes: entity.upvotes,
                    downvotes: entity.downvotes,
                    timestamp: Utc::now(),
                });
                info!(
                    entity_id,
                    kind = %kind,
                    reviewer_id = reviewer.reviewer_id,
                    "Consensus gate rejected {}: {}",
                    action,
                    reason
                );
                return Err(Error::Conflict(reason));
            }

            let old_status = entity.status;
            set_status(pool, entity_id, kind, new_status).await?;

            if new_status == EntityStatus::Cleared {
                remove_memberships(pool, entity_id, kind).await?;
            }

            history::record(pool, reviewer.reviewer_id, entity_id, kind, action).await?;

            if old_status != new_status {
                event_bus.emit_lossy(WardenEvent::EntityStatusChanged {
                    entity_id,
                    entity_kind: kind,
                    old_status,
                    new_status,
                    timestamp: Utc::now(),
                });
            }
            event_bus.emit_lossy(WardenEvent::VoteCast {
                entity_id,
                entity_kind: kind,
                reviewer_id: reviewer.reviewer_id,
                action,
                mode,
                upvotes: entity.upvotes,
                downvotes: entity.downvotes,
                timestamp: Utc::now(),
            });
            activity.log_entity(
                actor,
                format!("vote_{}", action),
                entity_id,
                kind,
                Some(format!("standard, status {} -> {}", old_status, new_status)),
            );

            let entity = get_entity(pool, entity_id, kind)
                .await?
                .ok_or_else(|| Error::Internal(format!("entity {}/{} vanished", kind, entity_id)))?;
            Ok(VoteOutcome { entity, mode, transitioned: old_status != new_status })
        }
    }
}
