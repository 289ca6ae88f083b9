//! Reviewer accountability checks
//!
//! A reviewer's votes are scored against the entities' final statuses:
//! confirm on a confirmed entity or clear on a cleared entity counts as
//! matching. Reviewers with enough scored votes and a poor match rate
//! are banned automatically. The ban is permanent and system-sourced;
//! lifting it requires a manual database edit.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use warden_common::audit::ActivityLogger;
use warden_common::db::models::ReviewerProfile;
use warden_common::events::{EventBus, WardenEvent};
use warden_common::params::Policy;
use warden_common::Result;

use crate::db::{history, reviewers};

/// Evaluate one reviewer's accuracy and ban them if it falls below the
/// policy floor. Returns true when a ban was applied by this call.
///
/// Only votes on entities that have reached a terminal status are
/// scored, so a reviewer is never penalized for votes still awaiting
/// an outcome.
pub async fn evaluate_and_ban(
    pool: &SqlitePool,
    policy: &Policy,
    event_bus: &EventBus,
    activity: &ActivityLogger,
    reviewer: &ReviewerProfile,
) -> Result<bool> {
    if reviewer.banned {
        return Ok(false);
    }

    let (matching, total) = history::vote_accuracy(pool, reviewer.reviewer_id).await?;
    if total < policy.reviewer_min_votes {
        return Ok(false);
    }

    let accuracy = matching as f64 / total as f64;
    if accuracy >= policy.reviewer_min_accuracy {
        return Ok(false);
    }

    let reason = format!(
        "accuracy {:.0}% over {} scored votes, below the {:.0}% floor",
        accuracy * 100.0,
        total,
        policy.reviewer_min_accuracy * 100.0
    );
    reviewers::ban(pool, reviewer.reviewer_id, &reason, "system").await?;

    info!(reviewer_id = reviewer.reviewer_id, %accuracy, "Reviewer auto-banned: {}", reason);
    event_bus.emit_lossy(WardenEvent::ReviewerBanned {
        reviewer_id: reviewer.reviewer_id,
        reason: reason.clone(),
        timestamp: Utc::now(),
    });
    activity.log(warden_common::audit::ActivityEntry {
        detail: Some(reason),
        ..warden_common::audit::ActivityEntry::new(
            "system",
            format!("ban_reviewer:{}", reviewer.reviewer_id),
        )
    });

    Ok(true)
}

/// Best-effort wrapper for call sites where an evaluation failure must
/// not block the review flow.
pub async fn evaluate_best_effort(
    pool: &SqlitePool,
    policy: &Policy,
    event_bus: &EventBus,
    activity: &ActivityLogger,
    reviewer: &ReviewerProfile,
) -> bool {
    match evaluate_and_ban(pool, policy, event_bus, activity, reviewer).await {
        Ok(banned) => banned,
        Err(err) => {
            warn!(
                reviewer_id = reviewer.reviewer_id,
                "Accountability evaluation failed, continuing: {}", err
            );
            false
        }
    }
}
