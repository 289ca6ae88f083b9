//! Reviewer profiles
//!
//! Rows are created lazily on first contact. Privilege assignment is an
//! operator action (direct settings/SQL), not an API surface.

use sqlx::{Row, SqlitePool};

use warden_common::db::models::ReviewerProfile;
use warden_common::db::{from_millis_opt, to_millis};
use warden_common::Result;

/// Load the reviewer's profile, creating an unprivileged row on first
/// contact.
pub async fn get_or_create(pool: &SqlitePool, reviewer_id: i64) -> Result<ReviewerProfile> {
    sqlx::query(
        "INSERT OR IGNORE INTO reviewers (reviewer_id, created_at) VALUES (?, ?)",
    )
    .bind(reviewer_id)
    .bind(to_millis(chrono::Utc::now()))
    .execute(pool)
    .await?;

    let row = sqlx::query(
        "SELECT reviewer_id, privileged, banned, ban_reason, banned_at, banned_by
         FROM reviewers WHERE reviewer_id = ?",
    )
    .bind(reviewer_id)
    .fetch_one(pool)
    .await?;

    Ok(ReviewerProfile {
        reviewer_id: row.get("reviewer_id"),
        privileged: row.get::<i64, _>("privileged") != 0,
        banned: row.get::<i64, _>("banned") != 0,
        ban_reason: row.get("ban_reason"),
        banned_at: from_millis_opt(row.get("banned_at"))?,
        banned_by: row.get("banned_by"),
    })
}

/// Permanently ban a reviewer. Idempotent; an already-banned reviewer
/// keeps the original ban record.
pub async fn ban(
    pool: &SqlitePool,
    reviewer_id: i64,
    reason: &str,
    banned_by: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reviewers
        SET banned = 1, ban_reason = ?, banned_at = ?, banned_by = ?
        WHERE reviewer_id = ? AND banned = 0
        "#,
    )
    .bind(reason)
    .bind(to_millis(chrono::Utc::now()))
    .bind(banned_by)
    .bind(reviewer_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Grant or revoke Standard-mode privileges.
pub async fn set_privileged(pool: &SqlitePool, reviewer_id: i64, privileged: bool) -> Result<()> {
    get_or_create(pool, reviewer_id).await?;

    sqlx::query("UPDATE reviewers SET privileged = ? WHERE reviewer_id = ?")
        .bind(privileged as i64)
        .bind(reviewer_id)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::db::init::init_database;
    use tempfile::TempDir;

    async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn first_contact_creates_unprivileged_profile() {
        let (_dir, pool) = temp_pool().await;

        let profile = get_or_create(&pool, 42).await.unwrap();
        assert!(!profile.privileged);
        assert!(!profile.banned);
        assert!(profile.ban_reason.is_none());
    }

    #[tokio::test]
    async fn ban_is_permanent_and_idempotent() {
        let (_dir, pool) = temp_pool().await;
        get_or_create(&pool, 7).await.unwrap();

        ban(&pool, 7, "accuracy 0.20 below 0.40 over 15 votes", "system").await.unwrap();
        let profile = get_or_create(&pool, 7).await.unwrap();
        assert!(profile.banned);
        assert_eq!(profile.banned_by.as_deref(), Some("system"));
        let original_at = profile.banned_at;

        // Second ban does not rewrite the record
        ban(&pool, 7, "other reason", "admin").await.unwrap();
        let profile = get_or_create(&pool, 7).await.unwrap();
        assert_eq!(profile.banned_at, original_at);
        assert_eq!(profile.banned_by.as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn privilege_toggle() {
        let (_dir, pool) = temp_pool().await;

        set_privileged(&pool, 9, true).await.unwrap();
        assert!(get_or_create(&pool, 9).await.unwrap().privileged);

        set_privileged(&pool, 9, false).await.unwrap();
        assert!(!get_or_create(&pool, 9).await.unwrap().privileged);
    }
}
