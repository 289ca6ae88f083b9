//! Database initialization
//!
//! Creates the shared SQLite database on first run and brings the schema
//! up idempotently on every start. Both services call this; CREATE TABLE
//! IF NOT EXISTS makes concurrent startup safe.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pool sized for concurrent writers: two services plus scan workers
    // share this file, so keep headroom above the default of 10.
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers with one writer, which the worker
    // pool and the review service both depend on.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    // Initial busy timeout; re-applied from settings below
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // All schema creation is idempotent
    create_settings_table(&pool).await?;
    create_entities_table(&pool).await?;
    create_group_memberships_table(&pool).await?;
    create_processing_log_table(&pool).await?;
    create_work_queue_table(&pool).await?;
    create_reviewers_table(&pool).await?;
    create_review_history_table(&pool).await?;
    create_worker_status_table(&pool).await?;
    create_activity_log_table(&pool).await?;

    init_default_settings(&pool).await?;

    // Short busy timeout so contention surfaces as "database is locked"
    // quickly and the retry helper's exponential backoff takes over,
    // bounded by db_max_lock_wait_ms.
    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_lock_retry_ms'",
    )
    .fetch_optional(&pool)
    .await?
    .unwrap_or(250);

    let pragma_sql = format!("PRAGMA busy_timeout = {}", timeout_ms);
    sqlx::query(&pragma_sql).execute(&pool).await?;

    info!("Database busy timeout set to {} ms", timeout_ms);

    Ok(pool)
}

/// Create the settings table
///
/// Stores policy and tuning key-value pairs read through the PolicyCache.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the entities table
///
/// One row per user/group under moderation. Reasons are an embedded JSON
/// map keyed by reason type; status is a plain enum column, and all three
/// statuses live in this one table.
pub async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('user', 'group')),
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'flagged' CHECK (status IN ('flagged', 'confirmed', 'cleared')),
            reasons TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL DEFAULT 0.0,
            upvotes INTEGER NOT NULL DEFAULT 0,
            downvotes INTEGER NOT NULL DEFAULT 0,
            account_created_at INTEGER NOT NULL,
            first_flagged_at INTEGER NOT NULL,
            last_scanned INTEGER,
            last_updated INTEGER NOT NULL,
            last_viewed INTEGER,
            PRIMARY KEY (id, kind),
            CHECK (confidence >= 0.0 AND confidence <= 1.0),
            CHECK (upvotes >= 0),
            CHECK (downvotes >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(kind, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_last_scanned ON entities(last_scanned)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the group_memberships table
///
/// Links flagged users to the groups they belong to, for group-level
/// aggregation. Rows for an entity are removed when it is cleared.
pub async fn create_group_memberships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_memberships (
            group_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            added_at INTEGER NOT NULL,
            PRIMARY KEY (group_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_group_memberships_user ON group_memberships(user_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the processing_log table
///
/// Reprocessing cooldown records: one row per entity, created on first
/// scan and upserted on every later scan. Never deleted except by purge.
pub async fn create_processing_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_log (
            entity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('user', 'group')),
            last_processed INTEGER NOT NULL,
            next_scan_time INTEGER NOT NULL,
            PRIMARY KEY (entity_id, entity_kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_log_next_scan ON processing_log(next_scan_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the work_queue table
///
/// Durable rescan requests. At most one Pending/Processing row per entity
/// is enforced by the dedup check at enqueue time, not by a constraint:
/// Done rows for the same entity must be allowed to accumulate.
pub async fn create_work_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('user', 'group')),
            priority TEXT NOT NULL CHECK (priority IN ('high', 'low')),
            reason TEXT NOT NULL DEFAULT '',
            added_by TEXT NOT NULL,
            added_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'processing', 'done')),
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_queue_claim ON work_queue(status, priority, added_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_queue_entity ON work_queue(entity_id, entity_kind, status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the reviewers table
pub async fn create_reviewers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reviewers (
            reviewer_id INTEGER PRIMARY KEY,
            privileged INTEGER NOT NULL DEFAULT 0,
            banned INTEGER NOT NULL DEFAULT 0,
            ban_reason TEXT,
            banned_at INTEGER,
            banned_by TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the review_history table
///
/// Every view/vote/skip a reviewer performs. Feeds the recently-reviewed
/// exclusion window and the accuracy evaluation.
pub async fn create_review_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS review_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reviewer_id INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            entity_kind TEXT NOT NULL CHECK (entity_kind IN ('user', 'group')),
            action TEXT NOT NULL CHECK (action IN ('viewed', 'confirm', 'clear', 'skip')),
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_review_history_reviewer ON review_history(reviewer_id, entity_kind, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_review_history_entity ON review_history(entity_id, entity_kind)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the worker_status table
///
/// TTL-keyed liveness records, emulating a key-value store with expiry:
/// the status payload is a JSON blob under a (type, sub_type, id) key and
/// expired rows are reaped on every read.
pub async fn create_worker_status_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS worker_status (
            worker_type TEXT NOT NULL,
            sub_type TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            status_json TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (worker_type, sub_type, worker_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_worker_status_expires ON worker_status(expires_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the activity_log table
///
/// Audit trail written by the asynchronous activity logger.
pub async fn create_activity_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_id INTEGER,
            entity_kind TEXT,
            detail TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_activity_log_created ON activity_log(created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures every policy key exists with its default value, and resets
/// NULL values back to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Vote consensus policy
    ensure_setting(pool, "minimum_votes_required", "10").await?;
    ensure_setting(pool, "vote_consensus_threshold", "0.75").await?;

    // Reviewer accountability policy
    ensure_setting(pool, "reviewer_min_votes", "10").await?;
    ensure_setting(pool, "reviewer_min_accuracy", "0.40").await?;

    // Break enforcement
    ensure_setting(pool, "max_reviews_before_break", "50").await?;
    ensure_setting(pool, "min_break_duration_secs", "600").await?; // 10 minutes
    ensure_setting(pool, "review_session_window_secs", "3600").await?; // 1 hour

    // Recently-reviewed exclusion windows (asymmetric by kind)
    ensure_setting(pool, "recent_review_window_users", "50").await?;
    ensure_setting(pool, "recent_review_window_groups", "10").await?;

    // Reprocessing cooldown tiers: [min_age_days, interval_hours] pairs,
    // ascending by age. Newer entities are rechecked more often.
    ensure_setting(pool, "cooldown_tiers", "[[0,24],[30,72],[90,168],[365,720]]").await?;

    // Worker heartbeat / fleet health
    ensure_setting(pool, "heartbeat_interval_secs", "10").await?;
    ensure_setting(pool, "worker_status_ttl_secs", "600").await?; // 10 minutes
    ensure_setting(pool, "worker_staleness_threshold_secs", "60").await?;

    // Scan scheduling
    ensure_setting(pool, "scan_batch_size", "100").await?;
    ensure_setting(pool, "scan_worker_count", "2").await?;
    ensure_setting(pool, "scheduler_interval_secs", "300").await?;
    ensure_setting(pool, "detector_timeout_secs", "30").await?;

    // Queue hygiene
    ensure_setting(pool, "queue_stale_processing_secs", "1800").await?; // 30 minutes
    ensure_setting(pool, "queue_done_retention_secs", "604800").await?; // 7 days

    // Policy cache refresh
    ensure_setting(pool, "policy_cache_ttl_secs", "300").await?;

    // Database contention handling
    ensure_setting(pool, "db_max_lock_wait_ms", "5000").await?;
    ensure_setting(pool, "db_lock_retry_ms", "250").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
            .bind(key)
            .fetch_one(pool)
            .await?;

    if !exists {
        // INSERT OR IGNORE handles the race where both services pass the
        // exists check during concurrent first start.
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read a setting value; None when the key is absent or NULL.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.flatten())
}

/// Write a setting value (upsert).
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}
