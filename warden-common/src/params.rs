//! Policy parameter cache
//!
//! Typed view over the settings table with TTL caching. Constructed per
//! service and handed around explicitly in shared state; there is no
//! process-global instance. Invalid stored values fall back to defaults
//! with a warning so one bad edit cannot stall the pipeline.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

use crate::db::init::set_setting;
use crate::Result;

/// One reprocessing cooldown tier: entities at least `min_age_days` old
/// (by account creation) wait `interval_hours` between scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownTier {
    pub min_age_days: i64,
    pub interval_hours: i64,
}

static DEFAULT_COOLDOWN_TIERS: Lazy<Vec<CooldownTier>> = Lazy::new(|| {
    vec![
        CooldownTier { min_age_days: 0, interval_hours: 24 },
        CooldownTier { min_age_days: 30, interval_hours: 72 },
        CooldownTier { min_age_days: 90, interval_hours: 168 },
        CooldownTier { min_age_days: 365, interval_hours: 720 },
    ]
});

/// All tunable policy values, parsed and validated
///
/// The `db_lock_retry_ms` setting is not carried here; it is applied as
/// the connection busy timeout during pool initialization.
#[derive(Debug, Clone, Serialize)]
pub struct Policy {
    // Vote consensus
    pub minimum_votes_required: i64,
    pub vote_consensus_threshold: f64,

    // Reviewer accountability
    pub reviewer_min_votes: i64,
    pub reviewer_min_accuracy: f64,

    // Break enforcement
    pub max_reviews_before_break: i64,
    pub min_break_duration_secs: i64,
    pub review_session_window_secs: i64,

    // Recently-reviewed exclusion windows
    pub recent_review_window_users: i64,
    pub recent_review_window_groups: i64,

    // Reprocessing cooldown, ascending by age
    pub cooldown_tiers: Vec<CooldownTier>,

    // Worker fleet health
    pub heartbeat_interval_secs: i64,
    pub worker_status_ttl_secs: i64,
    pub worker_staleness_threshold_secs: i64,

    // Scan scheduling
    pub scan_batch_size: i64,
    pub scan_worker_count: i64,
    pub scheduler_interval_secs: i64,
    pub detector_timeout_secs: i64,

    // Queue hygiene
    pub queue_stale_processing_secs: i64,
    pub queue_done_retention_secs: i64,

    // Cache refresh
    pub policy_cache_ttl_secs: i64,

    // Lock contention budget for retry_on_lock callers
    pub db_max_lock_wait_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            minimum_votes_required: 10,
            vote_consensus_threshold: 0.75,
            reviewer_min_votes: 10,
            reviewer_min_accuracy: 0.40,
            max_reviews_before_break: 50,
            min_break_duration_secs: 600,
            review_session_window_secs: 3600,
            recent_review_window_users: 50,
            recent_review_window_groups: 10,
            cooldown_tiers: DEFAULT_COOLDOWN_TIERS.clone(),
            heartbeat_interval_secs: 10,
            worker_status_ttl_secs: 600,
            worker_staleness_threshold_secs: 60,
            scan_batch_size: 100,
            scan_worker_count: 2,
            scheduler_interval_secs: 300,
            detector_timeout_secs: 30,
            queue_stale_processing_secs: 1800,
            queue_done_retention_secs: 604_800,
            policy_cache_ttl_secs: 300,
            db_max_lock_wait_ms: 5000,
        }
    }
}

struct CachedPolicy {
    loaded_at: Instant,
    ttl: Duration,
    policy: Arc<Policy>,
}

/// TTL-cached policy reader/writer over the settings table
///
/// Clone-cheap via an inner Arc is not needed; services hold it inside
/// their shared state Arc. `get` serves from cache within the TTL,
/// `set` writes through and invalidates so the next read sees the change.
pub struct PolicyCache {
    pool: SqlitePool,
    cached: RwLock<Option<CachedPolicy>>,
}

impl PolicyCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cached: RwLock::new(None) }
    }

    /// Current policy, reloading from the database when the cached copy
    /// is missing or older than its TTL.
    pub async fn get(&self) -> Result<Arc<Policy>> {
        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < cached.ttl {
                    return Ok(Arc::clone(&cached.policy));
                }
            }
        }

        self.reload().await
    }

    /// Force a fresh load, replacing the cached copy.
    pub async fn reload(&self) -> Result<Arc<Policy>> {
        let policy = Arc::new(self.load_from_db().await?);
        let ttl = Duration::from_secs(policy.policy_cache_ttl_secs.max(1) as u64);

        let mut guard = self.cached.write().await;
        *guard = Some(CachedPolicy {
            loaded_at: Instant::now(),
            ttl,
            policy: Arc::clone(&policy),
        });

        Ok(policy)
    }

    /// Write one setting through to the database and invalidate the cache.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        set_setting(&self.pool, key, value).await?;
        self.invalidate().await;
        Ok(())
    }

    /// Drop the cached copy; the next `get` reloads.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn load_from_db(&self) -> Result<Policy> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let value: Option<String> = row.get("value");
            if let Some(value) = value {
                map.insert(key, value);
            }
        }
        let raw = RawSettings(map);

        let defaults = Policy::default();
        Ok(Policy {
            minimum_votes_required: raw
                .i64_at_least("minimum_votes_required", 1, defaults.minimum_votes_required),
            vote_consensus_threshold: raw.f64_in(
                "vote_consensus_threshold",
                0.5,
                1.0,
                defaults.vote_consensus_threshold,
            ),
            reviewer_min_votes: raw.i64_at_least("reviewer_min_votes", 1, defaults.reviewer_min_votes),
            reviewer_min_accuracy: raw.f64_in(
                "reviewer_min_accuracy",
                0.0,
                1.0,
                defaults.reviewer_min_accuracy,
            ),
            max_reviews_before_break: raw.i64_at_least(
                "max_reviews_before_break",
                1,
                defaults.max_reviews_before_break,
            ),
            min_break_duration_secs: raw.i64_at_least(
                "min_break_duration_secs",
                1,
                defaults.min_break_duration_secs,
            ),
            review_session_window_secs: raw.i64_at_least(
                "review_session_window_secs",
                1,
                defaults.review_session_window_secs,
            ),
            recent_review_window_users: raw.i64_at_least(
                "recent_review_window_users",
                0,
                defaults.recent_review_window_users,
            ),
            recent_review_window_groups: raw.i64_at_least(
                "recent_review_window_groups",
                0,
                defaults.recent_review_window_groups,
            ),
            cooldown_tiers: raw.cooldown_tiers("cooldown_tiers"),
            heartbeat_interval_secs: raw.i64_at_least(
                "heartbeat_interval_secs",
                1,
                defaults.heartbeat_interval_secs,
            ),
            worker_status_ttl_secs: raw.i64_at_least(
                "worker_status_ttl_secs",
                1,
                defaults.worker_status_ttl_secs,
            ),
            worker_staleness_threshold_secs: raw.i64_at_least(
                "worker_staleness_threshold_secs",
                1,
                defaults.worker_staleness_threshold_secs,
            ),
            scan_batch_size: raw.i64_at_least("scan_batch_size", 1, defaults.scan_batch_size),
            scan_worker_count: raw.i64_at_least("scan_worker_count", 1, defaults.scan_worker_count),
            scheduler_interval_secs: raw.i64_at_least(
                "scheduler_interval_secs",
                1,
                defaults.scheduler_interval_secs,
            ),
            detector_timeout_secs: raw.i64_at_least(
                "detector_timeout_secs",
                1,
                defaults.detector_timeout_secs,
            ),
            queue_stale_processing_secs: raw.i64_at_least(
                "queue_stale_processing_secs",
                1,
                defaults.queue_stale_processing_secs,
            ),
            queue_done_retention_secs: raw.i64_at_least(
                "queue_done_retention_secs",
                0,
                defaults.queue_done_retention_secs,
            ),
            policy_cache_ttl_secs: raw.i64_at_least(
                "policy_cache_ttl_secs",
                1,
                defaults.policy_cache_ttl_secs,
            ),
            db_max_lock_wait_ms: raw.u64_at_least(
                "db_max_lock_wait_ms",
                1,
                defaults.db_max_lock_wait_ms,
            ),
        })
    }
}

struct RawSettings(HashMap<String, String>);

impl RawSettings {
    fn i64_at_least(&self, key: &str, min: i64, default: i64) -> i64 {
        match self.0.get(key).map(|v| v.parse::<i64>()) {
            Some(Ok(value)) if value >= min => value,
            Some(Ok(value)) => {
                warn!("Setting '{}' = {} below minimum {}, using default {}", key, value, min, default);
                default
            }
            Some(Err(_)) => {
                warn!("Setting '{}' = '{}' is not an integer, using default {}", key, self.0[key], default);
                default
            }
            None => default,
        }
    }

    fn u64_at_least(&self, key: &str, min: u64, default: u64) -> u64 {
        match self.0.get(key).map(|v| v.parse::<u64>()) {
            Some(Ok(value)) if value >= min => value,
            Some(Ok(value)) => {
                warn!("Setting '{}' = {} below minimum {}, using default {}", key, value, min, default);
                default
            }
            Some(Err(_)) => {
                warn!("Setting '{}' = '{}' is not an integer, using default {}", key, self.0[key], default);
                default
            }
            None => default,
        }
    }

    fn f64_in(&self, key: &str, lo: f64, hi: f64, default: f64) -> f64 {
        match self.0.get(key).map(|v| v.parse::<f64>()) {
            Some(Ok(value)) if value >= lo && value <= hi => value,
            Some(Ok(value)) => {
                warn!(
                    "Setting '{}' = {} outside [{}, {}], using default {}",
                    key, value, lo, hi, default
                );
                default
            }
            Some(Err(_)) => {
                warn!("Setting '{}' = '{}' is not a number, using default {}", key, self.0[key], default);
                default
            }
            None => default,
        }
    }

    fn cooldown_tiers(&self, key: &str) -> Vec<CooldownTier> {
        let Some(raw) = self.0.get(key) else {
            return DEFAULT_COOLDOWN_TIERS.clone();
        };

        let pairs: Vec<[i64; 2]> = match serde_json::from_str(raw) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("Setting '{}' is not a valid tier list ({}), using defaults", key, e);
                return DEFAULT_COOLDOWN_TIERS.clone();
            }
        };

        let tiers: Vec<CooldownTier> = pairs
            .into_iter()
            .map(|[min_age_days, interval_hours]| CooldownTier { min_age_days, interval_hours })
            .collect();

        if let Err(reason) = validate_tiers(&tiers) {
            warn!("Setting '{}' rejected ({}), using defaults", key, reason);
            return DEFAULT_COOLDOWN_TIERS.clone();
        }

        tiers
    }
}

/// Tier list rules: non-empty, ages non-negative and strictly ascending,
/// intervals positive and non-decreasing (older entities never get
/// rechecked more often than newer ones).
fn validate_tiers(tiers: &[CooldownTier]) -> std::result::Result<(), String> {
    if tiers.is_empty() {
        return Err("empty tier list".to_string());
    }

    if tiers[0].min_age_days < 0 {
        return Err(format!("negative min_age_days {}", tiers[0].min_age_days));
    }

    for window in tiers.windows(2) {
        if window[1].min_age_days <= window[0].min_age_days {
            return Err(format!(
                "min_age_days not ascending ({} then {})",
                window[0].min_age_days, window[1].min_age_days
            ));
        }
        if window[1].interval_hours < window[0].interval_hours {
            return Err(format!(
                "interval_hours decreasing ({} then {})",
                window[0].interval_hours, window[1].interval_hours
            ));
        }
    }

    for tier in tiers {
        if tier.interval_hours <= 0 {
            return Err(format!("non-positive interval_hours {}", tier.interval_hours));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::{init_database, set_setting};
    use tempfile::TempDir;

    async fn temp_cache() -> (TempDir, SqlitePool, PolicyCache) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        let cache = PolicyCache::new(pool.clone());
        (dir, pool, cache)
    }

    #[tokio::test]
    async fn fresh_database_yields_defaults() {
        let (_dir, _pool, cache) = temp_cache().await;

        let policy = cache.get().await.unwrap();
        assert_eq!(policy.minimum_votes_required, 10);
        assert_eq!(policy.vote_consensus_threshold, 0.75);
        assert_eq!(policy.reviewer_min_accuracy, 0.40);
        assert_eq!(policy.cooldown_tiers.len(), 4);
        assert_eq!(policy.cooldown_tiers[0].interval_hours, 24);
    }

    #[tokio::test]
    async fn invalid_values_fall_back_to_defaults() {
        let (_dir, pool, cache) = temp_cache().await;

        set_setting(&pool, "vote_consensus_threshold", "not a number").await.unwrap();
        set_setting(&pool, "minimum_votes_required", "-5").await.unwrap();
        set_setting(&pool, "reviewer_min_accuracy", "1.5").await.unwrap();

        let policy = cache.get().await.unwrap();
        assert_eq!(policy.vote_consensus_threshold, 0.75);
        assert_eq!(policy.minimum_votes_required, 10);
        assert_eq!(policy.reviewer_min_accuracy, 0.40);
    }

    #[tokio::test]
    async fn malformed_tiers_fall_back() {
        let (_dir, pool, cache) = temp_cache().await;

        for bad in [
            "not json",
            "[]",
            "[[30,72],[0,24]]",   // ages descending
            "[[0,72],[30,24]]",   // intervals decreasing
            "[[0,0]]",            // zero interval
        ] {
            set_setting(&pool, "cooldown_tiers", bad).await.unwrap();
            cache.invalidate().await;
            let policy = cache.get().await.unwrap();
            assert_eq!(policy.cooldown_tiers, *DEFAULT_COOLDOWN_TIERS, "input: {}", bad);
        }
    }

    #[tokio::test]
    async fn valid_tier_override_is_used() {
        let (_dir, pool, cache) = temp_cache().await;

        set_setting(&pool, "cooldown_tiers", "[[0,12],[7,48]]").await.unwrap();
        let policy = cache.get().await.unwrap();

        assert_eq!(policy.cooldown_tiers.len(), 2);
        assert_eq!(policy.cooldown_tiers[1], CooldownTier { min_age_days: 7, interval_hours: 48 });
    }

    #[tokio::test]
    async fn get_serves_cached_until_invalidated() {
        let (_dir, pool, cache) = temp_cache().await;

        let first = cache.get().await.unwrap();
        assert_eq!(first.minimum_votes_required, 10);

        // Direct write bypassing the cache is not visible yet
        set_setting(&pool, "minimum_votes_required", "25").await.unwrap();
        let still_cached = cache.get().await.unwrap();
        assert_eq!(still_cached.minimum_votes_required, 10);

        cache.invalidate().await;
        let reloaded = cache.get().await.unwrap();
        assert_eq!(reloaded.minimum_votes_required, 25);
    }

    #[tokio::test]
    async fn set_writes_through_and_invalidates() {
        let (_dir, _pool, cache) = temp_cache().await;

        cache.get().await.unwrap();
        cache.set("scan_batch_size", "17").await.unwrap();

        let policy = cache.get().await.unwrap();
        assert_eq!(policy.scan_batch_size, 17);
    }
}
