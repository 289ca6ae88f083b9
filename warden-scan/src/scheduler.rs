//! Scan scheduler
//!
//! One periodic task keeps the rescan pipeline fed: it pulls the flagged
//! entities most overdue for a scan, drops the ones still inside their
//! cooldown, enqueues the rest at Low priority, and performs queue
//! hygiene (returning stale Processing items, clearing old Done rows).
//! Reviewer-requested rechecks enter the same queue at High priority and
//! are never touched here.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_common::db::entities;
use warden_common::db::models::QueuePriority;
use warden_common::db::queue::{self, EnqueueRequest};
use warden_common::events::{EventBus, WardenEvent};
use warden_common::params::{Policy, PolicyCache};
use warden_common::{Error, Result};

use crate::cooldown;
use crate::worker::heartbeat::{self, Heartbeat};

/// `added_by` marker for scheduler-originated queue items
const SCHEDULER_ACTOR: &str = "scheduler";

/// Counters from one scheduler pass
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub candidates: usize,
    pub eligible: usize,
    pub queued: usize,
    pub requeued: u64,
    pub cleaned: u64,
}

pub struct Scheduler {
    pool: SqlitePool,
    policy: Arc<PolicyCache>,
    event_bus: EventBus,
    heartbeat: Heartbeat,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        policy: Arc<PolicyCache>,
        event_bus: EventBus,
        heartbeat: Heartbeat,
    ) -> Self {
        Self { pool, policy, event_bus, heartbeat }
    }

    /// Cycle loop until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!("Scan scheduler started");
        loop {
            if token.is_cancelled() {
                break;
            }

            let policy = match self.policy.get().await {
                Ok(p) => p,
                Err(e) => {
                    error!("Scheduler could not load policy, using defaults: {}", e);
                    Arc::new(Policy::default())
                }
            };

            match self.run_cycle(&policy).await {
                Ok(stats) => {
                    self.heartbeat.set_healthy(true).await;
                    info!(
                        candidates = stats.candidates,
                        eligible = stats.eligible,
                        queued = stats.queued,
                        requeued = stats.requeued,
                        cleaned = stats.cleaned,
                        "Scan cycle complete"
                    );
                }
                Err(e) => {
                    self.heartbeat.set_healthy(false).await;
                    error!("Scan cycle failed: {}", e);
                }
            }
            self.heartbeat.set_idle().await;

            let period = Duration::from_secs(policy.scheduler_interval_secs.max(1) as u64);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        info!("Scan scheduler stopped");
    }

    /// One full pass: candidates, cooldown filter, enqueue, hygiene.
    pub async fn run_cycle(&self, policy: &Policy) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let now = Utc::now();

        self.heartbeat.set_task("selecting candidates", 0.0).await;
        let candidates = entities::scan_candidates(&self.pool, policy.scan_batch_size).await?;
        stats.candidates = candidates.len();

        let eligible = cooldown::filter_eligible(&self.pool, candidates, now).await;
        stats.eligible = eligible.len();

        if stats.candidates > 0 {
            let held = stats.candidates - stats.eligible;
            debug!(
                candidates = stats.candidates,
                held,
                "Cooldown held back {:.0}% of the batch",
                held as f64 / stats.candidates as f64 * 100.0
            );
        }

        self.heartbeat.set_task("enqueueing eligible candidates", 40.0).await;
        for (id, kind, _created) in &eligible {
            let req = EnqueueRequest {
                entity_id: *id,
                entity_kind: *kind,
                priority: QueuePriority::Low,
                reason: "scheduled rescan".to_string(),
                added_by: SCHEDULER_ACTOR.to_string(),
            };
            match queue::enqueue(&self.pool, &req, true).await {
                Ok(_) => stats.queued += 1,
                Err(Error::Conflict(_)) => {
                    debug!(entity_id = *id, kind = %kind, "Already queued, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        self.heartbeat.set_task("queue hygiene", 80.0).await;
        let stale_cutoff = now - ChronoDuration::seconds(policy.queue_stale_processing_secs);
        stats.requeued = queue::requeue_stale(&self.pool, stale_cutoff).await?;
        if stats.requeued > 0 {
            warn!(requeued = stats.requeued, "Returned stale processing items to pending");
        }

        let done_cutoff = now - ChronoDuration::seconds(policy.queue_done_retention_secs);
        stats.cleaned = queue::cleanup_done(&self.pool, done_cutoff).await?;

        self.event_bus.emit_lossy(WardenEvent::ScanCycleCompleted {
            candidates: stats.candidates,
            eligible: stats.eligible,
            queued: stats.queued,
            timestamp: Utc::now(),
        });

        Ok(stats)
    }
}

/// Spawn the scheduler and its heartbeat publisher.
pub fn spawn(
    pool: SqlitePool,
    policy: Arc<PolicyCache>,
    event_bus: EventBus,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let hb = Heartbeat::new("scan", "scheduler", "scheduler".to_string());
    let publisher = heartbeat::spawn(pool.clone(), policy.clone(), hb.clone(), token.clone());
    let scheduler = Scheduler::new(pool, policy, event_bus, hb);
    vec![publisher, tokio::spawn(scheduler.run(token))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use warden_common::db::entities::EntitySnapshot;
    use warden_common::db::init::init_database;
    use warden_common::db::models::{EntityKind, QueueStatus};
    use warden_common::db::{processing_log, to_millis};

    async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    async fn seed_entity(pool: &SqlitePool, id: i64) {
        let snap = EntitySnapshot {
            id,
            kind: EntityKind::User,
            name: format!("entity-{}", id),
            account_created_at: Utc::now() - ChronoDuration::days(10),
            groups: vec![],
        };
        entities::upsert_snapshot(pool, &snap).await.unwrap();
    }

    fn scheduler(pool: &SqlitePool) -> (Scheduler, EventBus) {
        let bus = EventBus::new(64);
        let scheduler = Scheduler::new(
            pool.clone(),
            Arc::new(PolicyCache::new(pool.clone())),
            bus.clone(),
            Heartbeat::new("scan", "scheduler", "scheduler".to_string()),
        );
        (scheduler, bus)
    }

    #[tokio::test]
    async fn cycle_enqueues_eligible_candidates_at_low_priority() {
        let (_dir, pool) = temp_pool().await;
        for id in 1..=3 {
            seed_entity(&pool, id).await;
        }
        // Entity 2 is still cooling down
        processing_log::mark_processed(
            &pool,
            2,
            EntityKind::User,
            Utc::now() + ChronoDuration::hours(12),
        )
        .await
        .unwrap();

        let (scheduler, _bus) = scheduler(&pool);
        let stats = scheduler.run_cycle(&Policy::default()).await.unwrap();

        assert_eq!(stats.candidates, 3);
        assert_eq!(stats.eligible, 2);
        assert_eq!(stats.queued, 2);

        let depths = queue::lengths(&pool).await.unwrap();
        assert_eq!(depths.low, 2);
        assert_eq!(depths.high, 0);
    }

    #[tokio::test]
    async fn cycle_skips_entities_already_queued() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 1).await;
        queue::enqueue(
            &pool,
            &EnqueueRequest {
                entity_id: 1,
                entity_kind: EntityKind::User,
                priority: QueuePriority::High,
                reason: "manual recheck".to_string(),
                added_by: "reviewer:9".to_string(),
            },
            true,
        )
        .await
        .unwrap();

        let (scheduler, _bus) = scheduler(&pool);
        let stats = scheduler.run_cycle(&Policy::default()).await.unwrap();

        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.queued, 0);

        // The manual request is untouched
        let depths = queue::lengths(&pool).await.unwrap();
        assert_eq!(depths.high, 1);
        assert_eq!(depths.low, 0);
    }

    #[tokio::test]
    async fn cycle_requeues_stale_processing_items() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 1).await;
        queue::enqueue(
            &pool,
            &EnqueueRequest {
                entity_id: 1,
                entity_kind: EntityKind::User,
                priority: QueuePriority::Low,
                reason: "scheduled rescan".to_string(),
                added_by: "scheduler".to_string(),
            },
            true,
        )
        .await
        .unwrap();
        let item = queue::claim_next(&pool).await.unwrap().unwrap();

        // Backdate the claim beyond the stale window
        sqlx::query("UPDATE work_queue SET started_at = ? WHERE id = ?")
            .bind(to_millis(Utc::now() - ChronoDuration::hours(2)))
            .bind(item.id)
            .execute(&pool)
            .await
            .unwrap();

        let (scheduler, _bus) = scheduler(&pool);
        let stats = scheduler.run_cycle(&Policy::default()).await.unwrap();

        assert_eq!(stats.requeued, 1);
        let info = queue::queue_info(&pool, 1, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(info.status, QueueStatus::Pending);
        // Enqueue saw the item still Processing, so dedup kept it to one row
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn cycle_cleans_done_items_past_retention() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 1).await;
        queue::enqueue(
            &pool,
            &EnqueueRequest {
                entity_id: 1,
                entity_kind: EntityKind::User,
                priority: QueuePriority::Low,
                reason: "scheduled rescan".to_string(),
                added_by: "scheduler".to_string(),
            },
            true,
        )
        .await
        .unwrap();
        let item = queue::claim_next(&pool).await.unwrap().unwrap();
        queue::complete(&pool, item.id).await.unwrap();

        // Mark the entity as freshly scanned so the cycle does not requeue,
        // and age the done row past retention
        processing_log::mark_processed(
            &pool,
            1,
            EntityKind::User,
            Utc::now() + ChronoDuration::hours(12),
        )
        .await
        .unwrap();
        sqlx::query("UPDATE work_queue SET completed_at = ? WHERE id = ?")
            .bind(to_millis(Utc::now() - ChronoDuration::days(30)))
            .bind(item.id)
            .execute(&pool)
            .await
            .unwrap();

        let (scheduler, _bus) = scheduler(&pool);
        let stats = scheduler.run_cycle(&Policy::default()).await.unwrap();

        assert_eq!(stats.cleaned, 1);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn cycle_emits_completion_event() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 1).await;

        let (scheduler, bus) = scheduler(&pool);
        let mut rx = bus.subscribe();
        scheduler.run_cycle(&Policy::default()).await.unwrap();

        let event = rx.try_recv().unwrap();
        match event {
            WardenEvent::ScanCycleCompleted { candidates, eligible, queued, .. } => {
                assert_eq!(candidates, 1);
                assert_eq!(eligible, 1);
                assert_eq!(queued, 1);
            }
            other => panic!("unexpected event: {}", other.event_type()),
        }
    }

    #[tokio::test]
    async fn empty_backlog_is_a_quiet_cycle() {
        let (_dir, pool) = temp_pool().await;
        let (scheduler, _bus) = scheduler(&pool);

        let stats = scheduler.run_cycle(&Policy::default()).await.unwrap();
        assert_eq!(stats.candidates, 0);
        assert_eq!(stats.queued, 0);
    }
}
