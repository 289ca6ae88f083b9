//! Reprocessing cooldown
//!
//! Rescan frequency is tiered by account age: new accounts change fast
//! and are rescanned daily, dormant ones monthly. The scheduler filters
//! its candidate batch through here before queueing; workers record a
//! fresh cooldown after every scan.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use warden_common::db::models::EntityKind;
use warden_common::db::processing_log;
use warden_common::params::{CooldownTier, Policy};
use warden_common::Result;

/// Scan interval for an entity of the given account age.
///
/// Tiers ascend by age and the last tier the entity qualifies for wins.
/// An entity younger than every tier falls back to a daily interval.
pub fn interval_for_age(age_days: i64, tiers: &[CooldownTier]) -> Duration {
    let mut hours = 24;
    for tier in tiers {
        if age_days >= tier.min_age_days {
            hours = tier.interval_hours;
        } else {
            break;
        }
    }
    Duration::hours(hours)
}

/// Filter a candidate batch down to the entities past their cooldown.
///
/// A candidate with no processing record has never been scanned and is
/// always eligible. If the cooldown lookup itself fails, the whole batch
/// passes through: an early rescan is recoverable, a stalled pipeline
/// is not.
pub async fn filter_eligible(
    pool: &SqlitePool,
    candidates: Vec<(i64, EntityKind, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Vec<(i64, EntityKind, DateTime<Utc>)> {
    let keys: Vec<(i64, EntityKind)> =
        candidates.iter().map(|(id, kind, _)| (*id, *kind)).collect();

    let entries = match processing_log::fetch_entries(pool, &keys).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cooldown lookup failed, passing batch through: {}", e);
            return candidates;
        }
    };

    candidates
        .into_iter()
        .filter(|(id, kind, _)| match entries.get(&(*id, *kind)) {
            Some(entry) => now >= entry.next_scan_time,
            None => true,
        })
        .collect()
}

/// Record a completed scan and schedule the next by the entity's age tier.
pub async fn mark_processed(
    pool: &SqlitePool,
    policy: &Policy,
    entity_id: i64,
    kind: EntityKind,
    account_created_at: DateTime<Utc>,
) -> Result<()> {
    let now = Utc::now();
    let age_days = (now - account_created_at).num_days();
    let next = now + interval_for_age(age_days, &policy.cooldown_tiers);
    processing_log::mark_processed(pool, entity_id, kind, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_common::db::init::init_database;

    async fn temp_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    fn candidate(id: i64, kind: EntityKind) -> (i64, EntityKind, DateTime<Utc>) {
        (id, kind, Utc::now() - Duration::days(10))
    }

    #[test]
    fn interval_picks_the_last_qualifying_tier() {
        let tiers = Policy::default().cooldown_tiers;

        assert_eq!(interval_for_age(0, &tiers), Duration::hours(24));
        assert_eq!(interval_for_age(29, &tiers), Duration::hours(24));
        assert_eq!(interval_for_age(30, &tiers), Duration::hours(72));
        assert_eq!(interval_for_age(90, &tiers), Duration::hours(168));
        assert_eq!(interval_for_age(400, &tiers), Duration::hours(720));
    }

    #[test]
    fn interval_defaults_to_daily_below_all_tiers() {
        let tiers = vec![CooldownTier { min_age_days: 7, interval_hours: 48 }];
        assert_eq!(interval_for_age(3, &tiers), Duration::hours(24));
        assert_eq!(interval_for_age(7, &tiers), Duration::hours(48));
    }

    #[tokio::test]
    async fn never_scanned_candidates_are_eligible() {
        let (_dir, pool) = temp_pool().await;

        let candidates = vec![candidate(1, EntityKind::User), candidate(2, EntityKind::Group)];
        let eligible = filter_eligible(&pool, candidates, Utc::now()).await;

        assert_eq!(eligible.len(), 2);
    }

    #[tokio::test]
    async fn cooling_candidates_are_held_back() {
        let (_dir, pool) = temp_pool().await;
        let now = Utc::now();

        // 1 still cooling, 2 past its window, 3 never scanned
        processing_log::mark_processed(&pool, 1, EntityKind::User, now + Duration::hours(12))
            .await
            .unwrap();
        processing_log::mark_processed(&pool, 2, EntityKind::User, now - Duration::hours(1))
            .await
            .unwrap();

        let candidates = vec![
            candidate(1, EntityKind::User),
            candidate(2, EntityKind::User),
            candidate(3, EntityKind::User),
        ];
        let eligible = filter_eligible(&pool, candidates, now).await;

        let ids: Vec<i64> = eligible.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn eligibility_boundary_is_inclusive() {
        let (_dir, pool) = temp_pool().await;
        let now = Utc::now();

        processing_log::mark_processed(&pool, 1, EntityKind::User, now).await.unwrap();

        let eligible = filter_eligible(&pool, vec![candidate(1, EntityKind::User)], now).await;
        assert_eq!(eligible.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_is_scoped_per_kind() {
        let (_dir, pool) = temp_pool().await;
        let now = Utc::now();

        // User 5 cooling; group 5 shares the numeric id but is untouched
        processing_log::mark_processed(&pool, 5, EntityKind::User, now + Duration::hours(12))
            .await
            .unwrap();

        let candidates = vec![candidate(5, EntityKind::User), candidate(5, EntityKind::Group)];
        let eligible = filter_eligible(&pool, candidates, now).await;

        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].1, EntityKind::Group);
    }

    #[tokio::test]
    async fn mark_processed_schedules_by_age_tier() {
        let (_dir, pool) = temp_pool().await;
        let policy = Policy::default();

        // 400-day-old account lands in the 720-hour tier
        let created = Utc::now() - Duration::days(400);
        mark_processed(&pool, &policy, 9, EntityKind::User, created).await.unwrap();

        let entry = processing_log::get_entry(&pool, 9, EntityKind::User)
            .await
            .unwrap()
            .unwrap();
        let gap = entry.next_scan_time - entry.last_processed;
        assert!(gap >= Duration::hours(719) && gap <= Duration::hours(721));
    }
}
