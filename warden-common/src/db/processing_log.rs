//! Reprocessing cooldown log
//!
//! One row per entity recording when it was last scanned and when it next
//! becomes eligible. The scheduler consults this in bulk; entities with no
//! row have never been scanned and are always eligible.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::db::models::{EntityKind, ProcessingLogEntry};
use crate::db::retry::retry_on_lock;
use crate::db::{from_millis, to_millis};
use crate::Result;

/// Record a completed scan and the earliest time the next one may run.
///
/// Idempotent upsert, retried through lock contention.
pub async fn mark_processed(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
    next_scan_time: DateTime<Utc>,
) -> Result<()> {
    let now_ms = to_millis(Utc::now());
    let next_ms = to_millis(next_scan_time);

    // Get max lock wait time from settings (default 5000ms)
    let max_wait_ms: i64 =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_max_lock_wait_ms'")
            .fetch_optional(pool)
            .await?
            .unwrap_or(5000);

    retry_on_lock("mark_processed", max_wait_ms as u64, || async {
        sqlx::query(
            r#"
            INSERT INTO processing_log (entity_id, entity_kind, last_processed, next_scan_time)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(entity_id, entity_kind) DO UPDATE SET
                last_processed = excluded.last_processed,
                next_scan_time = excluded.next_scan_time
            "#,
        )
        .bind(entity_id)
        .bind(kind.as_str())
        .bind(now_ms)
        .bind(next_ms)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

pub async fn get_entry(
    pool: &SqlitePool,
    entity_id: i64,
    kind: EntityKind,
) -> Result<Option<ProcessingLogEntry>> {
    let row = sqlx::query(
        "SELECT entity_id, entity_kind, last_processed, next_scan_time
         FROM processing_log WHERE entity_id = ? AND entity_kind = ?",
    )
    .bind(entity_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(row_to_entry).transpose()
}

/// Fetch cooldown entries for a candidate batch in one query.
///
/// Returns a map keyed by (id, kind); candidates absent from the map have
/// no cooldown on record.
pub async fn fetch_entries(
    pool: &SqlitePool,
    keys: &[(i64, EntityKind)],
) -> Result<HashMap<(i64, EntityKind), ProcessingLogEntry>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }

    // Candidate batches are bounded by scan_batch_size, well under the
    // SQLite bind-parameter limit.
    let placeholders = keys.iter().map(|_| "(?, ?)").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT entity_id, entity_kind, last_processed, next_scan_time
         FROM processing_log WHERE (entity_id, entity_kind) IN (VALUES {})",
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for (id, kind) in keys {
        query = query.bind(id).bind(kind.as_str());
    }

    let rows = query.fetch_all(pool).await?;

    let mut entries = HashMap::with_capacity(rows.len());
    for row in rows {
        let entry = row_to_entry(row)?;
        entries.insert((entry.entity_id, entry.entity_kind), entry);
    }

    Ok(entries)
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<ProcessingLogEntry> {
    Ok(ProcessingLogEntry {
        entity_id: row.get("entity_id"),
        entity_kind: row.get::<String, _>("entity_kind").parse()?,
        last_processed: from_millis(row.get("last_processed"))?,
        next_scan_time: from_millis(row.get("next_scan_time"))?,
    })
}
