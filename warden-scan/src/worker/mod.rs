//! Queue workers
//!
//! Each worker claims items off the priority queue, runs the detector
//! against the entity, merges findings, and completes the item. Detector
//! failures and timeouts degrade to a scan with no new findings; the item
//! still completes so the queue keeps moving. A worker that dies mid-item
//! leaves it Processing for the scheduler's stale requeue to recover.

pub mod heartbeat;

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_common::db::models::{QueueItem, Reason};
use warden_common::db::{entities, queue};
use warden_common::events::{EventBus, WardenEvent};
use warden_common::params::PolicyCache;
use warden_common::Result;

use crate::cooldown;
use crate::detector::Detector;
use crate::evidence;
use crate::worker::heartbeat::Heartbeat;

/// Poll delay when the queue is empty
const IDLE_POLL: Duration = Duration::from_secs(2);

pub struct ScanWorker {
    pool: SqlitePool,
    policy: Arc<PolicyCache>,
    event_bus: EventBus,
    detector: Arc<dyn Detector>,
    heartbeat: Heartbeat,
}

impl ScanWorker {
    pub fn new(
        pool: SqlitePool,
        policy: Arc<PolicyCache>,
        event_bus: EventBus,
        detector: Arc<dyn Detector>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self { pool, policy, event_bus, detector, heartbeat }
    }

    /// Claim-process loop until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!(worker_id = %self.heartbeat.worker_id(), "Scan worker started");
        loop {
            if token.is_cancelled() {
                break;
            }
            match queue::claim_next(&self.pool).await {
                Ok(Some(item)) => {
                    match self.process(&item).await {
                        Ok(findings) => {
                            self.heartbeat.set_healthy(true).await;
                            info!(
                                entity_id = item.entity_id,
                                kind = %item.entity_kind,
                                findings,
                                "Rescan complete"
                            );
                        }
                        Err(e) => {
                            // Item stays Processing; the scheduler's stale
                            // requeue returns it to Pending
                            self.heartbeat.set_healthy(false).await;
                            error!(
                                entity_id = item.entity_id,
                                kind = %item.entity_kind,
                                "Rescan failed: {}",
                                e
                            );
                        }
                    }
                    self.heartbeat.set_idle().await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    self.heartbeat.set_healthy(false).await;
                    error!("Failed to claim queue item: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.heartbeat.worker_id(), "Scan worker stopped");
    }

    /// Scan one claimed item. Returns the number of findings merged.
    async fn process(&self, item: &QueueItem) -> Result<usize> {
        self.heartbeat
            .set_task(format!("scanning {} {}", item.entity_kind, item.entity_id), 0.0)
            .await;

        let entity = entities::get_entity(&self.pool, item.entity_id, item.entity_kind).await?;
        let Some(entity) = entity else {
            // Deleted between enqueue and claim; complete so the queue
            // does not wedge on a ghost
            warn!(
                entity_id = item.entity_id,
                kind = %item.entity_kind,
                "Queued entity no longer exists"
            );
            queue::complete(&self.pool, item.id).await?;
            return Ok(0);
        };

        let policy = self.policy.get().await?;
        let timeout = Duration::from_secs(policy.detector_timeout_secs.max(1) as u64);

        let findings = match tokio::time::timeout(timeout, self.detector.detect(&entity)).await {
            Ok(Ok(findings)) => findings,
            Ok(Err(e)) => {
                warn!(
                    entity_id = entity.id,
                    kind = %entity.kind,
                    "Detector call failed, completing scan without findings: {}",
                    e
                );
                vec![]
            }
            Err(_) => {
                warn!(
                    entity_id = entity.id,
                    kind = %entity.kind,
                    "Detector timed out after {}s, completing scan without findings",
                    policy.detector_timeout_secs
                );
                vec![]
            }
        };

        if !findings.is_empty() {
            self.heartbeat
                .set_task(format!("merging {} {}", item.entity_kind, item.entity_id), 50.0)
                .await;

            let merged =
                entities::update_reasons(&self.pool, entity.id, entity.kind, |reasons| {
                    for f in &findings {
                        let incoming = Reason {
                            message: f.message.clone(),
                            confidence: f.confidence,
                            evidence: f.evidence.clone(),
                        };
                        evidence::merge(reasons, f.reason_type, &incoming, &f.source);
                    }
                })
                .await?;

            for f in &findings {
                self.event_bus.emit_lossy(WardenEvent::ReasonMerged {
                    entity_id: entity.id,
                    entity_kind: entity.kind,
                    reason_type: f.reason_type,
                    source: f.source.clone(),
                    confidence: merged.confidence,
                    timestamp: Utc::now(),
                });
            }
        }

        entities::touch_last_scanned(&self.pool, entity.id, entity.kind, Utc::now()).await?;
        cooldown::mark_processed(
            &self.pool,
            &policy,
            entity.id,
            entity.kind,
            entity.account_created_at,
        )
        .await?;
        queue::complete(&self.pool, item.id).await?;

        self.event_bus.emit_lossy(WardenEvent::RecheckCompleted {
            entity_id: entity.id,
            entity_kind: entity.kind,
            findings: findings.len(),
            timestamp: Utc::now(),
        });

        Ok(findings.len())
    }
}

/// Spawn `count` workers, each with its own heartbeat publisher.
pub fn spawn_fleet(
    pool: SqlitePool,
    policy: Arc<PolicyCache>,
    event_bus: EventBus,
    detector: Arc<dyn Detector>,
    count: i64,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for index in 0..count.max(1) {
        let hb = Heartbeat::new("scan", "worker", format!("worker-{}", index));
        handles.push(heartbeat::spawn(pool.clone(), policy.clone(), hb.clone(), token.clone()));

        let worker = ScanWorker::new(
            pool.clone(),
            policy.clone(),
            event_bus.clone(),
            detector.clone(),
            hb,
        );
        handles.push(tokio::spawn(worker.run(token.clone())));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use warden_common::db::init::init_database;
    use warden_common::db::models::{Entity, EntityKind, QueuePriority, QueueStatus, ReasonType};
    use warden_common::db::processing_log;
    use warden_common::db::queue::EnqueueRequest;
    use warden_common::Error;

    use crate::detector::{DetectorError, Finding, NullDetector};

    struct StubDetector {
        findings: Vec<Finding>,
    }

    #[async_trait]
    impl Detector for StubDetector {
        async fn detect(&self, _entity: &Entity) -> std::result::Result<Vec<Finding>, DetectorError> {
            Ok(self.findings.clone())
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl Detector for FailingDetector {
        async fn detect(&self, _entity: &Entity) -> std::result::Result<Vec<Finding>, DetectorError> {
            Err(DetectorError::Network("connection refused".to_string()))
        }
    }

    struct SlowDetector;

    #[async_trait]
    impl Detector for SlowDetector {
        async fn detect(&self, _entity: &Entity) -> std::result::Result<Vec<Finding>, DetectorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }
    }

    async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    async fn seed_entity(pool: &SqlitePool, id: i64, kind: EntityKind) {
        let snap = warden_common::db::entities::EntitySnapshot {
            id,
            kind,
            name: format!("entity-{}", id),
            account_created_at: Utc::now() - ChronoDuration::days(10),
            groups: vec![],
        };
        warden_common::db::entities::upsert_snapshot(pool, &snap).await.unwrap();
    }

    async fn enqueue_and_claim(pool: &SqlitePool, entity_id: i64) -> QueueItem {
        queue::enqueue(
            pool,
            &EnqueueRequest {
                entity_id,
                entity_kind: EntityKind::User,
                priority: QueuePriority::Low,
                reason: "test".to_string(),
                added_by: "scheduler".to_string(),
            },
            true,
        )
        .await
        .unwrap();
        queue::claim_next(pool).await.unwrap().unwrap()
    }

    fn worker(pool: &SqlitePool, detector: Arc<dyn Detector>) -> (ScanWorker, EventBus) {
        let bus = EventBus::new(64);
        let worker = ScanWorker::new(
            pool.clone(),
            Arc::new(PolicyCache::new(pool.clone())),
            bus.clone(),
            detector,
            Heartbeat::new("scan", "worker", "worker-0".to_string()),
        );
        (worker, bus)
    }

    fn finding(reason_type: ReasonType, message: &str, confidence: f64, source: &str) -> Finding {
        Finding {
            reason_type,
            message: message.to_string(),
            confidence,
            evidence: vec![],
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn process_merges_findings_and_completes() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 1, EntityKind::User).await;
        let item = enqueue_and_claim(&pool, 1).await;

        let detector = Arc::new(StubDetector {
            findings: vec![
                finding(ReasonType::Profile, "bad username", 0.8, "A"),
                finding(ReasonType::Chat, "bad chat", 0.6, "B"),
            ],
        });
        let (worker, bus) = worker(&pool, detector);
        let mut rx = bus.subscribe();

        let merged = worker.process(&item).await.unwrap();
        assert_eq!(merged, 2);

        let entity = entities::get_entity(&pool, 1, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(entity.reasons[&ReasonType::Profile].message, "[A] bad username");
        assert_eq!(entity.reasons[&ReasonType::Chat].message, "[B] bad chat");
        assert_eq!(entity.confidence, 0.8);
        assert!(entity.last_scanned.is_some());

        // Cooldown recorded
        assert!(processing_log::get_entry(&pool, 1, EntityKind::User)
            .await
            .unwrap()
            .is_some());

        // Item done, queue empty
        let info = queue::queue_info(&pool, 1, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(info.status, QueueStatus::Done);
        assert!(queue::claim_next(&pool).await.unwrap().is_none());

        let mut types = vec![];
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type().to_string());
        }
        assert_eq!(types, vec!["ReasonMerged", "ReasonMerged", "RecheckCompleted"]);
    }

    #[tokio::test]
    async fn detector_failure_still_completes_the_scan() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 2, EntityKind::User).await;
        let item = enqueue_and_claim(&pool, 2).await;

        let (worker, bus) = worker(&pool, Arc::new(FailingDetector));
        let mut rx = bus.subscribe();

        let merged = worker.process(&item).await.unwrap();
        assert_eq!(merged, 0);

        let entity = entities::get_entity(&pool, 2, EntityKind::User).await.unwrap().unwrap();
        assert!(entity.reasons.is_empty());
        assert!(entity.last_scanned.is_some());

        let info = queue::queue_info(&pool, 2, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(info.status, QueueStatus::Done);

        // No merge events, just the completion
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type(), "RecheckCompleted");
    }

    #[tokio::test]
    async fn detector_timeout_degrades_to_no_findings() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 3, EntityKind::User).await;
        let item = enqueue_and_claim(&pool, 3).await;

        let policy = Arc::new(PolicyCache::new(pool.clone()));
        policy.set("detector_timeout_secs", "1").await.unwrap();

        let worker = ScanWorker::new(
            pool.clone(),
            policy,
            EventBus::new(64),
            Arc::new(SlowDetector),
            Heartbeat::new("scan", "worker", "worker-0".to_string()),
        );

        let merged = worker.process(&item).await.unwrap();
        assert_eq!(merged, 0);

        let info = queue::queue_info(&pool, 3, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(info.status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn vanished_entity_completes_the_item() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 4, EntityKind::User).await;
        let item = enqueue_and_claim(&pool, 4).await;

        sqlx::query("DELETE FROM entities WHERE id = 4")
            .execute(&pool)
            .await
            .unwrap();

        let (worker, _bus) = worker(&pool, Arc::new(NullDetector));
        let merged = worker.process(&item).await.unwrap();
        assert_eq!(merged, 0);

        let info = queue::queue_info(&pool, 4, EntityKind::User).await.unwrap().unwrap();
        assert_eq!(info.status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn run_loop_drains_the_queue_and_stops_on_cancel() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 5, EntityKind::User).await;
        queue::enqueue(
            &pool,
            &EnqueueRequest {
                entity_id: 5,
                entity_kind: EntityKind::User,
                priority: QueuePriority::High,
                reason: "test".to_string(),
                added_by: "reviewer:1".to_string(),
            },
            true,
        )
        .await
        .unwrap();

        let (worker, _bus) = worker(&pool, Arc::new(NullDetector));
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));

        // Wait for the worker to drain the item
        let mut done = false;
        for _ in 0..50 {
            let info = queue::queue_info(&pool, 5, EntityKind::User).await.unwrap().unwrap();
            if info.status == QueueStatus::Done {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(done, "worker never completed the queued item");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn process_propagates_storage_errors() {
        let (_dir, pool) = temp_pool().await;
        seed_entity(&pool, 6, EntityKind::User).await;
        let item = enqueue_and_claim(&pool, 6).await;
        let (worker, _bus) = worker(&pool, Arc::new(NullDetector));

        pool.close().await;

        let err = worker.process(&item).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }
}
