//! Worker heartbeat publisher
//!
//! Every background task owns a `Heartbeat` handle it updates as work
//! progresses; a companion publisher task periodically writes the current
//! snapshot to the worker status store. Publish cadence carries a small
//! random jitter so a fleet started together does not thump the database
//! in lockstep.

use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_common::db::models::WorkerStatus;
use warden_common::db::worker_status;
use warden_common::params::{Policy, PolicyCache};

struct TaskState {
    current_task: String,
    progress: f64,
    healthy: bool,
}

/// Shared view of what a worker is currently doing
#[derive(Clone)]
pub struct Heartbeat {
    worker_type: String,
    sub_type: String,
    worker_id: String,
    state: Arc<RwLock<TaskState>>,
}

impl Heartbeat {
    pub fn new(worker_type: &str, sub_type: &str, worker_id: String) -> Self {
        Self {
            worker_type: worker_type.to_string(),
            sub_type: sub_type.to_string(),
            worker_id,
            state: Arc::new(RwLock::new(TaskState {
                current_task: "idle".to_string(),
                progress: 0.0,
                healthy: true,
            })),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn set_task(&self, task: impl Into<String>, progress: f64) {
        let mut state = self.state.write().await;
        state.current_task = task.into();
        state.progress = progress;
    }

    pub async fn set_idle(&self) {
        self.set_task("idle", 0.0).await;
    }

    /// Marks the worker unhealthy after a failed cycle; the next clean
    /// cycle clears it.
    pub async fn set_healthy(&self, healthy: bool) {
        self.state.write().await.healthy = healthy;
    }

    /// Current status stamped with the present time.
    pub async fn snapshot(&self) -> WorkerStatus {
        let state = self.state.read().await;
        WorkerStatus {
            worker_type: self.worker_type.clone(),
            sub_type: self.sub_type.clone(),
            worker_id: self.worker_id.clone(),
            last_seen: Utc::now(),
            current_task: state.current_task.clone(),
            progress: state.progress,
            healthy: state.healthy,
        }
    }
}

/// Write one status row for this heartbeat.
pub async fn publish(pool: &SqlitePool, heartbeat: &Heartbeat, ttl_secs: i64) {
    let status = heartbeat.snapshot().await;
    if let Err(e) = worker_status::report(pool, &status, ttl_secs).await {
        warn!(worker_id = %status.worker_id, "Failed to publish heartbeat: {}", e);
    }
}

/// Spawn the publisher loop for a heartbeat handle.
///
/// Publishes immediately, then on every `heartbeat_interval_secs` tick
/// (plus up to a second of jitter) until the token is cancelled.
pub fn spawn(
    pool: SqlitePool,
    policy: Arc<PolicyCache>,
    heartbeat: Heartbeat,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = match policy.get().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Heartbeat could not load policy, using defaults: {}", e);
                    Arc::new(Policy::default())
                }
            };

            publish(&pool, &heartbeat, current.worker_status_ttl_secs).await;

            let jitter_ms = rand::thread_rng().gen_range(0..1000);
            let period = Duration::from_secs(current.heartbeat_interval_secs.max(1) as u64)
                + Duration::from_millis(jitter_ms);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!(worker_id = %heartbeat.worker_id(), "Heartbeat publisher stopped");
    })
}
