//! Review target selection
//!
//! Order of gates: break enforcement, then accountability, then the
//! exclusion window, then the status-priority fallback. A reviewer on
//! break or an empty backlog are normal outcomes, not errors.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use warden_common::audit::ActivityLogger;
use warden_common::db::entities::touch_last_viewed;
use warden_common::db::models::{
    Entity, EntityKind, ReviewAction, ReviewerProfile, SortBy, TargetMode,
};
use warden_common::events::{EventBus, WardenEvent};
use warden_common::params::Policy;
use warden_common::Result;

use crate::accountability;
use crate::breaks::{BreakCheck, BreakTracker};
use crate::db::candidates::{self, Exclusions};
use crate::db::history;

/// What the selector decided for this request
#[derive(Debug)]
pub enum SelectOutcome {
    /// Entity granted for review
    Target(Entity),
    /// Reviewer must wait until the given time
    OnBreak { until: chrono::DateTime<Utc> },
    /// Reviewer was banned by the accountability check during this call
    Banned { reason: String },
    /// Backlog is empty under every fallback status
    Nothing,
}

/// Pick the next entity for a reviewer, or report why none was granted.
///
/// On success the view is recorded in history (feeding the exclusion
/// window), the entity's `last_viewed` is bumped, and an activity entry
/// is queued.
#[allow(clippy::too_many_arguments)]
pub async fn next_target(
    pool: &SqlitePool,
    policy: &Policy,
    event_bus: &EventBus,
    activity: &ActivityLogger,
    breaks: &BreakTracker,
    reviewer: &ReviewerProfile,
    sort_by: SortBy,
    target_mode: TargetMode,
) -> Result<SelectOutcome> {
    let now = Utc::now();

    match breaks.check_and_count(reviewer.reviewer_id, policy, now).await {
        BreakCheck::OnBreak { until, just_started } => {
            if just_started {
                event_bus.emit_lossy(WardenEvent::BreakStarted {
                    reviewer_id: reviewer.reviewer_id,
                    until,
                    timestamp: now,
                });
                activity.log(warden_common::audit::ActivityEntry {
                    detail: Some(format!("until {}", until.to_rfc3339())),
                    ..warden_common::audit::ActivityEntry::new(
                        "system",
                        format!("break_start:{}", reviewer.reviewer_id),
                    )
                });
            }
            return Ok(SelectOutcome::OnBreak { until });
        }
        BreakCheck::Proceed => {}
    }

    if accountability::evaluate_best_effort(pool, policy, event_bus, activity, reviewer).await {
        return Ok(SelectOutcome::Banned {
            reason: "review accuracy below the required floor".to_string(),
        });
    }

    let excluded = Exclusions {
        users: history::recent_entity_ids(
            pool,
            reviewer.reviewer_id,
            EntityKind::User,
            policy.recent_review_window_users,
        )
        .await?,
        groups: history::recent_entity_ids(
            pool,
            reviewer.reviewer_id,
            EntityKind::Group,
            policy.recent_review_window_groups,
        )
        .await?,
    };

    for status in target_mode.fallback_order() {
        let Some(entity) = candidates::find_candidate(pool, status, sort_by, &excluded).await?
        else {
            debug!(status = %status, "No candidates, advancing fallback");
            continue;
        };

        history::record(pool, reviewer.reviewer_id, entity.id, entity.kind, ReviewAction::Viewed)
            .await?;
        touch_last_viewed(pool, entity.id, entity.kind, now).await?;
        activity.log_entity(
            format!("reviewer:{}", reviewer.reviewer_id),
            "review_view",
            entity.id,
            entity.kind,
            Some(format!("status {}", entity.status)),
        );

        return Ok(SelectOutcome::Target(entity));
    }

    Ok(SelectOutcome::Nothing)
}
