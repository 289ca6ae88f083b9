//! Review history
//!
//! Every view, vote, and skip lands here. The recently-reviewed exclusion
//! and the accountability accuracy evaluation both read from this table.

use sqlx::{Row, SqlitePool};

use warden_common::db::models::{EntityKind, ReviewAction};
use warden_common::db::to_millis;
use warden_common::Result;

/// Record one reviewer action against an entity.
pub async fn record(
    pool: &SqlitePool,
    reviewer_id: i64,
    entity_id: i64,
    kind: EntityKind,
    action: ReviewAction,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO review_history (reviewer_id, entity_id, entity_kind, action, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(reviewer_id)
    .bind(entity_id)
    .bind(kind.as_str())
    .bind(action.as_str())
    .bind(to_millis(chrono::Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Entity ids appearing in the reviewer's most recent `window` history rows
/// of the given kind. These are excluded from candidacy to spread review
/// load and reduce repeat bias.
pub async fn recent_entity_ids(
    pool: &SqlitePool,
    reviewer_id: i64,
    kind: EntityKind,
    window: i64,
) -> Result<Vec<i64>> {
    if window <= 0 {
        return Ok(Vec::new());
    }

    let ids = sqlx::query_scalar(
        r#"
        SELECT DISTINCT entity_id FROM (
            SELECT entity_id FROM review_history
            WHERE reviewer_id = ? AND entity_kind = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
        )
        "#,
    )
    .bind(reviewer_id)
    .bind(kind.as_str())
    .bind(window)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// All-time vote accuracy inputs for one reviewer.
///
/// Counts the reviewer's Confirm/Clear votes on entities that have since
/// reached a verdict (Confirmed or Cleared), and how many of those votes
/// match the verdict. Votes on still-Flagged entities are not judged.
pub async fn vote_accuracy(pool: &SqlitePool, reviewer_id: i64) -> Result<(i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE
                WHEN rh.action = 'confirm' AND e.status = 'confirmed' THEN 1
                WHEN rh.action = 'clear' AND e.status = 'cleared' THEN 1
                ELSE 0
            END), 0) AS matching
        FROM review_history rh
        JOIN entities e ON e.id = rh.entity_id AND e.kind = rh.entity_kind
        WHERE rh.reviewer_id = ?
          AND rh.action IN ('confirm', 'clear')
          AND e.status IN ('confirmed', 'cleared')
        "#,
    )
    .bind(reviewer_id)
    .fetch_one(pool)
    .await?;

    Ok((row.get("matching"), row.get("total")))
}
