//! Entity persistence
//!
//! One row per (id, kind). The reasons map is an embedded JSON column and
//! is only ever updated through [`update_reasons`], which runs the
//! read-modify-write inside a transaction so concurrent detectors cannot
//! destroy each other's contributions.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::db::models::{Entity, EntityKind, EntityStatus, ReasonMap};
use crate::db::retry::retry_on_lock;
use crate::db::{from_millis, from_millis_opt, to_millis};
use crate::{Error, Result};

/// Identity fields a detector submits when it first saves or refreshes an
/// entity. Snapshots never carry reasons, votes, or status.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub account_created_at: DateTime<Utc>,
    /// Group ids a user belongs to; ignored for groups
    pub groups: Vec<i64>,
}

/// Create or refresh an entity from a detector snapshot.
///
/// New entities start Flagged with an empty reasons map. Existing rows only
/// have their identity fields updated; reasons, votes, and status are left
/// untouched. User snapshots replace the stored group memberships.
pub async fn upsert_snapshot(pool: &SqlitePool, snap: &EntitySnapshot) -> Result<Entity> {
    let now = Utc::now();
    let now_ms = to_millis(now);
    let created_ms = to_millis(snap.account_created_at);

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO entities (
            id, kind, name, status, reasons, confidence,
            account_created_at, first_flagged_at, last_updated
        ) VALUES (?, ?, ?, 'flagged', '{}', 0.0, ?, ?, ?)
        ON CONFLICT(id, kind) DO UPDATE SET
            name = excluded.name,
            account_created_at = excluded.account_created_at,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(snap.id)
    .bind(snap.kind.as_str())
    .bind(&snap.name)
    .bind(created_ms)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    if snap.kind == EntityKind::User {
        sqlx::query("DELETE FROM group_memberships WHERE user_id = ?")
            .bind(snap.id)
            .execute(&mut *tx)
            .await?;

        for group_id in &snap.groups {
            sqlx::query(
                "INSERT OR IGNORE INTO group_memberships (group_id, user_id, added_at) VALUES (?, ?, ?)",
            )
            .bind(group_id)
            .bind(snap.id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    get_entity(pool, snap.id, snap.kind)
        .await?
        .ok_or_else(|| Error::Internal(format!("entity {}/{} vanished after upsert", snap.kind, snap.id)))
}

/// Load one entity.
pub async fn get_entity(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
) -> Result<Option<Entity>> {
    let row = sqlx::query(
        r#"
        SELECT id, kind, name, status, reasons, confidence, upvotes, downvotes,
               account_created_at, first_flagged_at, last_scanned, last_updated, last_viewed
        FROM entities
        WHERE id = ? AND kind = ?
        "#,
    )
    .bind(entity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(row_to_entity).transpose()
}

/// Convert an entities row into the model type.
pub fn row_to_entity(row: sqlx::sqlite::SqliteRow) -> Result<Entity> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let reasons: String = row.get("reasons");
    let reasons: ReasonMap = serde_json::from_str(&reasons)
        .map_err(|e| Error::Internal(format!("failed to deserialize reasons: {}", e)))?;

    Ok(Entity {
        id: row.get("id"),
        kind: kind.parse()?,
        name: row.get("name"),
        status: status.parse()?,
        reasons,
        confidence: row.get("confidence"),
        upvotes: row.get("upvotes"),
        downvotes: row.get("downvotes"),
        account_created_at: from_millis(row.get("account_created_at"))?,
        first_flagged_at: from_millis(row.get("first_flagged_at"))?,
        last_scanned: from_millis_opt(row.get("last_scanned"))?,
        last_updated: from_millis(row.get("last_updated"))?,
        last_viewed: from_millis_opt(row.get("last_viewed"))?,
    })
}

/// Read-modify-write the reasons map under a transaction.
///
/// The closure mutates the current map in place; the aggregate confidence
/// is recomputed as the max over reason confidences and `last_updated` is
/// bumped. Returns the updated entity.
pub async fn update_reasons<F>(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    mutate: F,
) -> Result<Entity>
where
    F: FnOnce(&mut ReasonMap),
{
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT reasons FROM entities WHERE id = ? AND kind = ?")
        .bind(entity_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *tx)
        .await?;

    let row = row.ok_or_else(|| {
        Error::NotFound(format!("entity {}/{} not found", kind, entity_id))
    })?;

    let stored: String = row.get("reasons");
    let mut reasons: ReasonMap = serde_json::from_str(&stored)
        .map_err(|e| Error::Internal(format!("failed to deserialize reasons: {}", e)))?;

    mutate(&mut reasons);

    let confidence = reasons
        .values()
        .map(|r| r.confidence)
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0);

    let serialized = serde_json::to_string(&reasons)
        .map_err(|e| Error::Internal(format!("failed to serialize reasons: {}", e)))?;

    sqlx::query(
        "UPDATE entities SET reasons = ?, confidence = ?, last_updated = ? WHERE id = ? AND kind = ?",
    )
    .bind(&serialized)
    .bind(confidence)
    .bind(to_millis(Utc::now()))
    .bind(entity_id)
    .bind(kind.as_str())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    get_entity(pool, entity_id, kind)
        .await?
        .ok_or_else(|| Error::Internal(format!("entity {}/{} vanished after update", kind, entity_id)))
}

/// Atomically adjust the reputation counters. Single-statement increment,
/// safe under concurrent votes and retried through lock contention.
/// Returns (upvotes, downvotes) after.
pub async fn increment_votes(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    up_delta: i64,
    down_delta: i64,
) -> Result<(i64, i64)> {
    // Get max lock wait time from settings (default 5000ms)
    let max_wait_ms: i64 =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_max_lock_wait_ms'")
            .fetch_optional(pool)
            .await?
            .unwrap_or(5000);

    let row = retry_on_lock("vote increment", max_wait_ms as u64, || async {
        let row = sqlx::query(
            r#"
            UPDATE entities
            SET upvotes = upvotes + ?, downvotes = downvotes + ?, last_updated = ?
            WHERE id = ? AND kind = ?
            RETURNING upvotes, downvotes
            "#,
        )
        .bind(up_delta)
        .bind(down_delta)
        .bind(to_millis(Utc::now()))
        .bind(entity_id)
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await?;

        Ok(row)
    })
    .await?;

    let row = row.ok_or_else(|| {
        Error::NotFound(format!("entity {}/{} not found", kind, entity_id))
    })?;

    Ok((row.get("upvotes"), row.get("downvotes")))
}

/// Transition the entity status. Callers are responsible for having run
/// the consensus gate first.
pub async fn set_status(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    status: EntityStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE entities SET status = ?, last_updated = ? WHERE id = ? AND kind = ?",
    )
    .bind(status.as_str())
    .bind(to_millis(Utc::now()))
    .bind(entity_id)
    .bind(kind.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("entity {}/{} not found", kind, entity_id)));
    }

    Ok(())
}

/// Record that a reviewer was shown this entity.
pub async fn touch_last_viewed(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    when: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE entities SET last_viewed = ? WHERE id = ? AND kind = ?")
        .bind(to_millis(when))
        .bind(entity_id)
        .bind(kind.as_str())
        .execute(pool)
        .await?;

    Ok(())
}

/// Record a completed scan.
pub async fn touch_last_scanned(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    when: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE entities SET last_scanned = ? WHERE id = ? AND kind = ?")
        .bind(to_millis(when))
        .bind(entity_id)
        .bind(kind.as_str())
        .execute(pool)
        .await?;

    Ok(())
}

/// Drop group-membership rows for a cleared entity: a cleared user is no
/// longer a signal for its groups, and a cleared group stops aggregating
/// its members.
pub async fn remove_memberships(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
) -> Result<u64> {
    let result = match kind {
        EntityKind::User => {
            sqlx::query("DELETE FROM group_memberships WHERE user_id = ?")
                .bind(entity_id)
                .execute(pool)
                .await?
        }
        EntityKind::Group => {
            sqlx::query("DELETE FROM group_memberships WHERE group_id = ?")
                .bind(entity_id)
                .execute(pool)
                .await?
        }
    };

    let removed = result.rows_affected();
    if removed > 0 {
        debug!(entity_id, kind = %kind, removed, "Removed group membership rows");
    }

    Ok(removed)
}

/// Flagged entities most overdue for a rescan, oldest-scanned first.
/// Feeds the scheduler's candidate set; cooldown filtering happens after.
pub async fn scan_candidates(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<(i64, EntityKind, DateTime<Utc>)>> {
    let rows = sqlx::query(
        r#"
        SELECT id, kind, account_created_at
        FROM entities
        WHERE status = 'flagged'
        ORDER BY last_scanned ASC NULLS FIRST
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("kind");
        candidates.push((
            row.get("id"),
            kind.parse::<EntityKind>()?,
            from_millis(row.get("account_created_at"))?,
        ));
    }

    Ok(candidates)
}
