//! Event types for the moderation pipeline
//!
//! Shared event definitions and EventBus for both services. Events are
//! broadcast in-process and forwarded to SSE subscribers; they are
//! notifications, not state. Every durable effect lands in the database
//! before its event is emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::models::{
    EntityKind, EntityStatus, QueuePriority, ReasonType, ReviewAction, ReviewMode,
};

/// Pipeline event types
///
/// Broadcast via EventBus and serialized for SSE transmission. All events
/// use this central enum for type safety and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WardenEvent {
    /// Detector findings were merged into an entity's reason map
    ///
    /// Triggers:
    /// - SSE: Refresh the entity detail view
    ReasonMerged {
        entity_id: i64,
        entity_kind: EntityKind,
        reason_type: ReasonType,
        /// Detector that contributed the finding
        source: String,
        /// Aggregate entity confidence after the merge
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// An entity moved between Flagged/Confirmed/Cleared
    ///
    /// Only the consensus arbiter emits this; scans never change status.
    ///
    /// Triggers:
    /// - SSE: Update status badges and queue views
    EntityStatusChanged {
        entity_id: i64,
        entity_kind: EntityKind,
        old_status: EntityStatus,
        new_status: EntityStatus,
        timestamp: DateTime<Utc>,
    },

    /// A reviewer's vote was recorded
    ///
    /// Triggers:
    /// - SSE: Update vote tallies on open entity views
    VoteCast {
        entity_id: i64,
        entity_kind: EntityKind,
        reviewer_id: i64,
        action: ReviewAction,
        mode: ReviewMode,
        /// Tallies after this vote
        upvotes: i64,
        downvotes: i64,
        timestamp: DateTime<Utc>,
    },

    /// A status change was attempted but rejected by the consensus gate
    ///
    /// Triggers:
    /// - SSE: Surface the blocked transition to moderation dashboards
    ConsensusBlocked {
        entity_id: i64,
        entity_kind: EntityKind,
        attempted: EntityStatus,
        upvotes: i64,
        downvotes: i64,
        timestamp: DateTime<Utc>,
    },

    /// A rescan request entered the work queue
    ///
    /// Triggers:
    /// - SSE: Update queue depth displays
    RecheckQueued {
        entity_id: i64,
        entity_kind: EntityKind,
        priority: QueuePriority,
        added_by: String,
        timestamp: DateTime<Utc>,
    },

    /// A scan worker finished processing a queued rescan
    ///
    /// Triggers:
    /// - SSE: Refresh the entity if a requester is watching it
    RecheckCompleted {
        entity_id: i64,
        entity_kind: EntityKind,
        /// Number of detector findings merged
        findings: usize,
        timestamp: DateTime<Utc>,
    },

    /// A reviewer was banned by the accountability check
    ///
    /// Triggers:
    /// - SSE: Notify admin dashboards
    ReviewerBanned {
        reviewer_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A reviewer hit the session review limit and was put on break
    ///
    /// Triggers:
    /// - SSE: Show the break countdown to the reviewer's UI
    BreakStarted {
        reviewer_id: i64,
        /// When the reviewer may resume
        until: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// The scheduler finished one enqueue cycle
    ///
    /// Triggers:
    /// - SSE: Update scan health displays
    ScanCycleCompleted {
        /// Entities considered this cycle
        candidates: usize,
        /// Candidates past their cooldown
        eligible: usize,
        /// Eligible candidates actually enqueued (dedup may skip some)
        queued: usize,
        timestamp: DateTime<Utc>,
    },
}

impl WardenEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            WardenEvent::ReasonMerged { .. } => "ReasonMerged",
            WardenEvent::EntityStatusChanged { .. } => "EntityStatusChanged",
            WardenEvent::VoteCast { .. } => "VoteCast",
            WardenEvent::ConsensusBlocked { .. } => "ConsensusBlocked",
            WardenEvent::RecheckQueued { .. } => "RecheckQueued",
            WardenEvent::RecheckCompleted { .. } => "RecheckCompleted",
            WardenEvent::ReviewerBanned { .. } => "ReviewerBanned",
            WardenEvent::BreakStarted { .. } => "BreakStarted",
            WardenEvent::ScanCycleCompleted { .. } => "ScanCycleCompleted",
        }
    }
}

/// Central event distribution bus
///
/// Wraps tokio::broadcast, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WardenEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` when no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: WardenEvent,
    ) -> Result<usize, broadcast::error::SendError<WardenEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring whether anyone is listening
    ///
    /// For notifications where a missing subscriber is normal, e.g. queue
    /// depth updates with no dashboard connected.
    pub fn emit_lossy(&self, event: WardenEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
