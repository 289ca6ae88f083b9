//! Candidate selection queries

use sqlx::SqlitePool;

use warden_common::db::entities::row_to_entity;
use warden_common::db::models::{Entity, EntityKind, EntityStatus, SortBy};
use warden_common::Result;

/// Recently-reviewed ids to skip, tracked separately per kind since user
/// and group ids share a numeric space.
#[derive(Debug, Default)]
pub struct Exclusions {
    pub users: Vec<i64>,
    pub groups: Vec<i64>,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// First entity of the given status under the requested ordering, across
/// both kinds, skipping excluded ids. None advances the status fallback.
pub async fn find_candidate(
    pool: &SqlitePool,
    status: EntityStatus,
    sort_by: SortBy,
    excluded: &Exclusions,
) -> Result<Option<Entity>> {
    let order_clause = match sort_by {
        SortBy::Random => "RANDOM()",
        SortBy::Confidence => "confidence DESC, id ASC",
        SortBy::LastUpdated => "last_updated ASC, id ASC",
        SortBy::Reputation => "(upvotes + downvotes) DESC, id ASC",
    };

    // Exclusion windows are policy-bounded (tens of ids), far below the
    // bind-parameter limit.
    let mut sql = String::from(
        r#"
        SELECT id, kind, name, status, reasons, confidence, upvotes, downvotes,
               account_created_at, first_flagged_at, last_scanned, last_updated, last_viewed
        FROM entities
        WHERE status = ?
        "#,
    );
    if !excluded.users.is_empty() {
        sql.push_str(&format!(
            " AND NOT (kind = ? AND id IN ({}))",
            placeholders(excluded.users.len())
        ));
    }
    if !excluded.groups.is_empty() {
        sql.push_str(&format!(
            " AND NOT (kind = ? AND id IN ({}))",
            placeholders(excluded.groups.len())
        ));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT 1", order_clause));

    let mut query = sqlx::query(&sql).bind(status.as_str());
    if !excluded.users.is_empty() {
        query = query.bind(EntityKind::User.as_str());
        for id in &excluded.users {
            query = query.bind(id);
        }
    }
    if !excluded.groups.is_empty() {
        query = query.bind(EntityKind::Group.as_str());
        for id in &excluded.groups {
            query = query.bind(id);
        }
    }

    let row = query.fetch_optional(pool).await?;
    row.map(row_to_entity).transpose()
}
