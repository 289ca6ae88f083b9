//! Priority work queue
//!
//! Durable rescan requests with two priority levels. Items move
//! Pending -> Processing -> Done; completion is the only removal path.
//! The queue never retries internally; callers own transient-error retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::{from_millis, from_millis_opt, to_millis};
use crate::db::models::{EntityKind, QueueItem, QueuePriority, QueueStatus};
use crate::{Error, Result};

/// What a producer submits to the queue
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub entity_id: i64,
    pub entity_kind: EntityKind,
    pub priority: QueuePriority,
    pub reason: String,
    pub added_by: String,
}

/// Queue state for one entity, as reported back to requesters
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub status: QueueStatus,
    pub priority: QueuePriority,
    /// 1-based position among Pending items of the same priority;
    /// 0 once the item is Processing or Done.
    pub position: i64,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

/// Pending depth per priority
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueLengths {
    pub high: i64,
    pub low: i64,
}

/// Add a rescan request.
///
/// With `check_exists`, an outstanding (Pending/Processing) item for the
/// same entity rejects the request with a Conflict carrying the existing
/// status so the caller can surface it instead of scheduling duplicate work.
pub async fn enqueue(
    pool: &SqlitePool,
    req: &EnqueueRequest,
    check_exists: bool,
) -> Result<QueueItem> {
    if check_exists {
        if let Some(info) = queue_info(pool, req.entity_id, req.entity_kind).await? {
            if info.status.is_outstanding() {
                return Err(Error::Conflict(format!(
                    "entity {}/{} already queued ({}, {} priority)",
                    req.entity_kind, req.entity_id, info.status, info.priority
                )));
            }
        }
    }

    let now_ms = to_millis(Utc::now());

    let row = sqlx::query(
        r#"
        INSERT INTO work_queue (entity_id, entity_kind, priority, reason, added_by, added_at, status)
        VALUES (?, ?, ?, ?, ?, ?, 'pending')
        RETURNING id, entity_id, entity_kind, priority, reason, added_by, added_at,
                  status, started_at, completed_at
        "#,
    )
    .bind(req.entity_id)
    .bind(req.entity_kind.as_str())
    .bind(req.priority.as_str())
    .bind(&req.reason)
    .bind(&req.added_by)
    .bind(now_ms)
    .fetch_one(pool)
    .await?;

    row_to_item(row)
}

/// Queue state for an entity: the outstanding item if one exists,
/// otherwise the most recent completed one. None when never queued.
pub async fn queue_info(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
) -> Result<Option<QueueInfo>> {
    let row = sqlx::query(
        r#"
        SELECT id, priority, added_by, added_at, status
        FROM work_queue
        WHERE entity_id = ? AND entity_kind = ?
        ORDER BY CASE WHEN status IN ('pending', 'processing') THEN 0 ELSE 1 END,
                 added_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(entity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let id: i64 = row.get("id");
    let priority: QueuePriority = row.get::<String, _>("priority").parse()?;
    let status: QueueStatus = row.get::<String, _>("status").parse()?;
    let added_at_ms: i64 = row.get("added_at");

    let position = if status == QueueStatus::Pending {
        let ahead: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM work_queue
            WHERE status = 'pending' AND priority = ?
              AND (added_at < ? OR (added_at = ? AND id < ?))
            "#,
        )
        .bind(priority.as_str())
        .bind(added_at_ms)
        .bind(added_at_ms)
        .bind(id)
        .fetch_one(pool)
        .await?;
        ahead + 1
    } else {
        0
    };

    Ok(Some(QueueInfo {
        status,
        priority,
        position,
        added_by: row.get("added_by"),
        added_at: from_millis(added_at_ms)?,
    }))
}

/// Pending count for one priority.
pub async fn length(pool: &SqlitePool, priority: QueuePriority) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM work_queue WHERE status = 'pending' AND priority = ?",
    )
    .bind(priority.as_str())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Pending counts for both priorities.
pub async fn lengths(pool: &SqlitePool) -> Result<QueueLengths> {
    Ok(QueueLengths {
        high: length(pool, QueuePriority::High).await?,
        low: length(pool, QueuePriority::Low).await?,
    })
}

/// Atomically claim the next item: High before Low, FIFO within a
/// priority. Returns None when the queue is empty.
pub async fn claim_next(pool: &SqlitePool) -> Result<Option<QueueItem>> {
    let row = sqlx::query(
        r#"
        UPDATE work_queue
        SET status = 'processing', started_at = ?
        WHERE id = (
            SELECT id FROM work_queue
            WHERE status = 'pending'
            ORDER BY CASE priority WHEN 'high' THEN 0 ELSE 1 END, added_at ASC, id ASC
            LIMIT 1
        )
        RETURNING id, entity_id, entity_kind, priority, reason, added_by, added_at,
                  status, started_at, completed_at
        "#,
    )
    .bind(to_millis(Utc::now()))
    .fetch_optional(pool)
    .await?;

    row.map(row_to_item).transpose()
}

/// Mark an item Done. Idempotent for already-completed items.
pub async fn complete(pool: &SqlitePool, item_id: i64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE work_queue SET status = 'done', completed_at = ? WHERE id = ? AND status != 'done'",
    )
    .bind(to_millis(Utc::now()))
    .bind(item_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM work_queue WHERE id = ?)")
                .bind(item_id)
                .fetch_one(pool)
                .await?;
        if !exists {
            return Err(Error::NotFound(format!("queue item {} not found", item_id)));
        }
    }

    Ok(())
}

/// Return Processing items started before the cutoff to Pending.
/// Covers workers that died mid-item, so dedup cannot wedge an entity.
pub async fn requeue_stale(pool: &SqlitePool, started_before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE work_queue SET status = 'pending', started_at = NULL WHERE status = 'processing' AND started_at < ?",
    )
    .bind(to_millis(started_before))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete Done items completed before the cutoff.
pub async fn cleanup_done(pool: &SqlitePool, completed_before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM work_queue WHERE status = 'done' AND completed_at < ?",
    )
    .bind(to_millis(completed_before))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        id: row.get("id"),
        entity_id: row.get("entity_id"),
        entity_kind: row.get::<String, _>("entity_kind").parse()?,
        priority: row.get::<String, _>("priority").parse()?,
        reason: row.get("reason"),
        added_by: row.get("added_by"),
        added_at: from_millis(row.get("added_at"))?,
        status: row.get::<String, _>("status").parse()?,
        started_at: from_millis_opt(row.get("started_at"))?,
        completed_at: from_millis_opt(row.get("completed_at"))?,
    })
}
