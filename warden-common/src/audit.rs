//! Asynchronous activity logger
//!
//! Audit rows are written by a dedicated task fed over an mpsc channel, so
//! request handlers never wait on the audit insert. Channel order is
//! preserved and the writer drains everything already queued before it
//! exits on shutdown.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::db::models::EntityKind;
use crate::db::retry::retry_on_lock;
use crate::db::to_millis;
use crate::Result;

/// One audit record
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub actor: String,
    pub action: String,
    pub entity_id: Option<i64>,
    pub entity_kind: Option<EntityKind>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Entry with the current time and no entity reference; fill in the
    /// optional fields with struct update syntax.
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            entity_id: None,
            entity_kind: None,
            detail: None,
            created_at: Utc::now(),
        }
    }
}

/// Handle for submitting audit entries
///
/// Cheap to clone; all clones feed the same writer task. The writer exits
/// once every handle is dropped and the channel is drained.
#[derive(Clone)]
pub struct ActivityLogger {
    tx: mpsc::UnboundedSender<ActivityEntry>,
}

impl ActivityLogger {
    /// Start the writer task. The JoinHandle completes after shutdown
    /// drain; await it during graceful shutdown to not lose tail entries.
    pub fn spawn(pool: SqlitePool, max_lock_wait_ms: u64) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_task(pool, rx, max_lock_wait_ms));
        (Self { tx }, handle)
    }

    /// Queue an entry for writing. Never blocks; if the writer is gone the
    /// entry is dropped with a warning.
    pub fn log(&self, entry: ActivityEntry) {
        if self.tx.send(entry).is_err() {
            warn!("Activity logger is shut down, dropping audit entry");
        }
    }

    /// Convenience for entries about a specific entity.
    pub fn log_entity(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        entity_id: i64,
        entity_kind: EntityKind,
        detail: Option<String>,
    ) {
        self.log(ActivityEntry {
            entity_id: Some(entity_id),
            entity_kind: Some(entity_kind),
            detail,
            ..ActivityEntry::new(actor, action)
        });
    }
}

async fn writer_task(
    pool: SqlitePool,
    mut rx: mpsc::UnboundedReceiver<ActivityEntry>,
    max_lock_wait_ms: u64,
) {
    debug!("Activity log writer started");

    while let Some(entry) = rx.recv().await {
        let result = retry_on_lock("activity log insert", max_lock_wait_ms, || {
            insert_entry(&pool, &entry)
        })
        .await;

        // Audit writes are best-effort: a failed insert must not take the
        // writer down with it.
        if let Err(e) = result {
            error!(
                actor = %entry.actor,
                action = %entry.action,
                "Failed to persist audit entry: {}",
                e
            );
        }
    }

    debug!("Activity log writer drained and stopped");
}

async fn insert_entry(pool: &SqlitePool, entry: &ActivityEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO activity_log (actor, action, entity_id, entity_kind, detail, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.actor)
    .bind(&entry.action)
    .bind(entry.entity_id)
    .bind(entry.entity_kind.map(|k| k.as_str()))
    .bind(&entry.detail)
    .bind(to_millis(entry.created_at))
    .execute(pool)
    .await?;

    Ok(())
}
