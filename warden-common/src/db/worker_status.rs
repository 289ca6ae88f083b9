//! Worker liveness store
//!
//! Workers publish a status row on every heartbeat; rows carry an expiry
//! and are reaped on read, so a worker that stops heartbeating disappears
//! on its own without a dedicated janitor.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::db::models::WorkerStatus;
use crate::db::retry::retry_on_lock;
use crate::db::to_millis;
use crate::Result;

/// Upsert a worker's status row, extending its expiry by `ttl_secs`.
///
/// Heartbeats are frequent and idempotent, so they retry through lock
/// contention rather than losing a beat.
pub async fn report(pool: &SqlitePool, status: &WorkerStatus, ttl_secs: i64) -> Result<()> {
    let status_json = serde_json::to_string(status)
        .map_err(|e| crate::Error::Internal(format!("failed to serialize worker status: {}", e)))?;
    let last_seen_ms = to_millis(status.last_seen);
    let expires_at_ms = to_millis(Utc::now() + chrono::Duration::seconds(ttl_secs));

    // Get max lock wait time from settings (default 5000ms)
    let max_wait_ms: i64 =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_max_lock_wait_ms'")
            .fetch_optional(pool)
            .await?
            .unwrap_or(5000);

    retry_on_lock("worker status report", max_wait_ms as u64, || async {
        sqlx::query(
            r#"
            INSERT INTO worker_status (worker_type, sub_type, worker_id, status_json, last_seen, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(worker_type, sub_type, worker_id) DO UPDATE SET
                status_json = excluded.status_json,
                last_seen = excluded.last_seen,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&status.worker_type)
        .bind(&status.sub_type)
        .bind(&status.worker_id)
        .bind(&status_json)
        .bind(last_seen_ms)
        .bind(expires_at_ms)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

/// All live worker statuses, oldest heartbeat first.
///
/// Expired rows are deleted before reading. A row whose JSON fails to
/// decode is skipped with a warning rather than failing the listing;
/// one bad writer should not blind the whole status page.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<WorkerStatus>> {
    reap_expired(pool, Utc::now()).await?;

    let rows = sqlx::query(
        "SELECT worker_type, sub_type, worker_id, status_json
         FROM worker_status ORDER BY last_seen ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut statuses = Vec::with_capacity(rows.len());
    for row in rows {
        let json: String = row.get("status_json");
        match serde_json::from_str::<WorkerStatus>(&json) {
            Ok(status) => statuses.push(status),
            Err(e) => {
                let worker_type: String = row.get("worker_type");
                let worker_id: String = row.get("worker_id");
                warn!(
                    "Skipping unreadable status for worker {}/{}: {}",
                    worker_type, worker_id, e
                );
            }
        }
    }

    Ok(statuses)
}

/// Delete rows whose expiry has passed. Returns the number removed.
pub async fn reap_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM worker_status WHERE expires_at <= ?")
        .bind(to_millis(now))
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::init_database;
    use tempfile::TempDir;

    async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    fn status(worker_id: &str) -> WorkerStatus {
        WorkerStatus {
            worker_type: "scan".to_string(),
            sub_type: "worker".to_string(),
            worker_id: worker_id.to_string(),
            last_seen: Utc::now(),
            current_task: "idle".to_string(),
            progress: 0.0,
            healthy: true,
        }
    }

    #[tokio::test]
    async fn report_then_list_round_trips() {
        let (_dir, pool) = temp_pool().await;

        report(&pool, &status("w1"), 600).await.unwrap();
        report(&pool, &status("w2"), 600).await.unwrap();

        let all = list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn report_upserts_same_worker() {
        let (_dir, pool) = temp_pool().await;

        report(&pool, &status("w1"), 600).await.unwrap();

        let mut updated = status("w1");
        updated.current_task = "scanning user 42".to_string();
        updated.progress = 50.0;
        report(&pool, &updated, 600).await.unwrap();

        let all = list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].current_task, "scanning user 42");
    }

    #[tokio::test]
    async fn expired_rows_removed_on_read() {
        let (_dir, pool) = temp_pool().await;

        // ttl of zero expires immediately
        report(&pool, &status("w1"), 0).await.unwrap();
        report(&pool, &status("w2"), 600).await.unwrap();

        let all = list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "w2");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM worker_status")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unreadable_row_is_skipped_not_fatal() {
        let (_dir, pool) = temp_pool().await;

        report(&pool, &status("good"), 600).await.unwrap();

        let expires = to_millis(Utc::now() + chrono::Duration::seconds(600));
        sqlx::query(
            "INSERT INTO worker_status (worker_type, sub_type, worker_id, status_json, last_seen, expires_at)
             VALUES ('scan', 'worker', 'bad', 'not json', 0, ?)",
        )
        .bind(expires)
        .execute(&pool)
        .await
        .unwrap();

        let all = list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].worker_id, "good");
    }
}
