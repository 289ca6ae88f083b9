//! Database models for the moderation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Kind of entity under moderation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Group,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EntityKind::User),
            "group" => Ok(EntityKind::Group),
            other => Err(Error::InvalidInput(format!("unknown entity kind: {}", other))),
        }
    }
}

/// Moderation status of an entity
///
/// Transitions only happen through the consensus arbiter; snapshots and
/// detector merges never touch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Flagged,
    Confirmed,
    Cleared,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Flagged => "flagged",
            EntityStatus::Confirmed => "confirmed",
            EntityStatus::Cleared => "cleared",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flagged" => Ok(EntityStatus::Flagged),
            "confirmed" => Ok(EntityStatus::Confirmed),
            "cleared" => Ok(EntityStatus::Cleared),
            other => Err(Error::InvalidInput(format!("unknown entity status: {}", other))),
        }
    }
}

/// Category of evidence a detector can contribute
///
/// Used as the key of the per-entity reasons map. BTreeMap keeps the
/// serialized JSON stable across merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonType {
    Profile,
    Friends,
    Outfit,
    Groups,
    Chat,
    Member,
}

impl ReasonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonType::Profile => "profile",
            ReasonType::Friends => "friends",
            ReasonType::Outfit => "outfit",
            ReasonType::Groups => "groups",
            ReasonType::Chat => "chat",
            ReasonType::Member => "member",
        }
    }
}

impl fmt::Display for ReasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(ReasonType::Profile),
            "friends" => Ok(ReasonType::Friends),
            "outfit" => Ok(ReasonType::Outfit),
            "groups" => Ok(ReasonType::Groups),
            "chat" => Ok(ReasonType::Chat),
            "member" => Ok(ReasonType::Member),
            other => Err(Error::InvalidInput(format!("unknown reason type: {}", other))),
        }
    }
}

/// One reconciled explanation for a reason type
///
/// The message is a newline-joined sequence of `[source] text` lines, one
/// per contributing detector. Evidence is an order-preserving deduplicated
/// set across all contributors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    pub message: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Map of reason type to its reconciled Reason
pub type ReasonMap = BTreeMap<ReasonType, Reason>;

/// An entity (user or group) under moderation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub status: EntityStatus,
    pub reasons: ReasonMap,
    /// Aggregate confidence: max over all reason confidences
    pub confidence: f64,
    pub upvotes: i64,
    pub downvotes: i64,
    /// When the account/group was created on the platform (drives the
    /// reprocessing interval)
    pub account_created_at: DateTime<Utc>,
    pub first_flagged_at: DateTime<Utc>,
    pub last_scanned: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub last_viewed: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn total_votes(&self) -> i64 {
        self.upvotes + self.downvotes
    }
}

/// Reprocessing cooldown record, one row per entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub entity_id: i64,
    pub entity_kind: EntityKind,
    pub last_processed: DateTime<Utc>,
    pub next_scan_time: DateTime<Utc>,
}

/// Rescan request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    High,
    Low,
}

impl QueuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::High => "high",
            QueuePriority::Low => "low",
        }
    }

    /// Smaller sorts first when claiming
    pub fn claim_rank(&self) -> i64 {
        match self {
            QueuePriority::High => 0,
            QueuePriority::Low => 1,
        }
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueuePriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(QueuePriority::High),
            "low" => Ok(QueuePriority::Low),
            other => Err(Error::InvalidInput(format!("unknown queue priority: {}", other))),
        }
    }
}

/// Lifecycle of a queue item: Pending -> Processing -> Done (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
        }
    }

    /// Pending and Processing items block re-enqueue of the same entity
    pub fn is_outstanding(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            other => Err(Error::InvalidInput(format!("unknown queue status: {}", other))),
        }
    }
}

/// A rescan request in the work queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub entity_id: i64,
    pub entity_kind: EntityKind,
    pub priority: QueuePriority,
    pub reason: String,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Liveness record a worker publishes on a fixed interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_type: String,
    pub sub_type: String,
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub current_task: String,
    /// 0.0 - 100.0
    pub progress: f64,
    pub healthy: bool,
}

/// A reviewer known to the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerProfile {
    pub reviewer_id: i64,
    pub privileged: bool,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub banned_at: Option<DateTime<Utc>>,
    pub banned_by: Option<String>,
}

/// What a reviewer did with an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Viewed,
    Confirm,
    Clear,
    Skip,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Viewed => "viewed",
            ReviewAction::Confirm => "confirm",
            ReviewAction::Clear => "clear",
            ReviewAction::Skip => "skip",
        }
    }

    /// Only confirm/clear count as votes for accuracy purposes
    pub fn is_vote(&self) -> bool {
        matches!(self, ReviewAction::Confirm | ReviewAction::Clear)
    }
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewed" => Ok(ReviewAction::Viewed),
            "confirm" => Ok(ReviewAction::Confirm),
            "clear" => Ok(ReviewAction::Clear),
            "skip" => Ok(ReviewAction::Skip),
            other => Err(Error::InvalidInput(format!("unknown review action: {}", other))),
        }
    }
}

/// Candidate ordering for target selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Random,
    Confidence,
    LastUpdated,
    Reputation,
}

/// Which entity status a reviewer prefers to be shown first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    #[default]
    FlaggedFirst,
    ConfirmedFirst,
    ClearedFirst,
}

impl TargetMode {
    /// Priority-ordered list of statuses to search; an empty status
    /// advances to the next one.
    pub fn fallback_order(&self) -> [EntityStatus; 3] {
        match self {
            TargetMode::FlaggedFirst => {
                [EntityStatus::Flagged, EntityStatus::Confirmed, EntityStatus::Cleared]
            }
            TargetMode::ConfirmedFirst => {
                [EntityStatus::Confirmed, EntityStatus::Flagged, EntityStatus::Cleared]
            }
            TargetMode::ClearedFirst => {
                [EntityStatus::Cleared, EntityStatus::Flagged, EntityStatus::Confirmed]
            }
        }
    }
}

/// Review mode applied to one vote/selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    Standard,
    Training,
}

impl ReviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMode::Standard => "standard",
            ReviewMode::Training => "training",
        }
    }
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_round_trip() {
        for kind in [EntityKind::User, EntityKind::Group] {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(EntityKind::from_str("channel").is_err());
    }

    #[test]
    fn status_round_trip() {
        for status in [EntityStatus::Flagged, EntityStatus::Confirmed, EntityStatus::Cleared] {
            assert_eq!(EntityStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn reason_map_serializes_with_snake_case_keys() {
        let mut reasons = ReasonMap::new();
        reasons.insert(
            ReasonType::Profile,
            Reason {
                message: "[rule-engine] inappropriate username".to_string(),
                confidence: 0.8,
                evidence: vec!["username".to_string()],
            },
        );
        let json = serde_json::to_string(&reasons).unwrap();
        assert!(json.contains("\"profile\""));

        let back: ReasonMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reasons);
    }

    #[test]
    fn reason_missing_evidence_defaults_empty() {
        let reason: Reason =
            serde_json::from_str(r#"{"message":"[a] x","confidence":0.5}"#).unwrap();
        assert!(reason.evidence.is_empty());
    }

    #[test]
    fn fallback_order_puts_preferred_status_first() {
        assert_eq!(TargetMode::FlaggedFirst.fallback_order()[0], EntityStatus::Flagged);
        assert_eq!(TargetMode::ConfirmedFirst.fallback_order()[0], EntityStatus::Confirmed);
        assert_eq!(TargetMode::ClearedFirst.fallback_order()[0], EntityStatus::Cleared);
        // every mode covers all three statuses
        for mode in [TargetMode::FlaggedFirst, TargetMode::ConfirmedFirst, TargetMode::ClearedFirst]
        {
            let order = mode.fallback_order();
            assert!(order.contains(&EntityStatus::Flagged));
            assert!(order.contains(&EntityStatus::Confirmed));
            assert!(order.contains(&EntityStatus::Cleared));
        }
    }

    #[test]
    fn outstanding_statuses_block_reenqueue() {
        assert!(QueueStatus::Pending.is_outstanding());
        assert!(QueueStatus::Processing.is_outstanding());
        assert!(!QueueStatus::Done.is_outstanding());
    }
}
