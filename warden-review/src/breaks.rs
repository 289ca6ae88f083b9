//! Mandatory break enforcement
//!
//! Per-reviewer session tracking: Available -> OnBreak -> Available. State
//! is in-memory per service instance; a restart forgives an in-progress
//! break, which is acceptable for a pacing mechanism (the durable review
//! history is what audits care about).

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use warden_common::params::Policy;

/// Outcome of the break gate for one selection attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakCheck {
    /// Counted toward the session; selection may proceed
    Proceed,
    /// Reviewer must wait until the given time
    OnBreak {
        until: DateTime<Utc>,
        /// True when this call scheduled the break (emit BreakStarted once)
        just_started: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct ReviewerSession {
    session_reviews: i64,
    window_start: DateTime<Utc>,
    next_review_time: Option<DateTime<Utc>>,
}

/// Tracks review pacing per reviewer
#[derive(Default)]
pub struct BreakTracker {
    sessions: RwLock<HashMap<i64, ReviewerSession>>,
}

impl BreakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the break gate for one selection attempt.
    ///
    /// Order matters: an active break blocks before anything else; an
    /// expired session window resets the counter; a counter at the limit
    /// schedules a break and starts a fresh session for afterwards;
    /// otherwise the attempt is counted and selection proceeds.
    pub async fn check_and_count(
        &self,
        reviewer_id: i64,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> BreakCheck {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(reviewer_id).or_insert(ReviewerSession {
            session_reviews: 0,
            window_start: now,
            next_review_time: None,
        });

        if let Some(until) = session.next_review_time {
            if now < until {
                return BreakCheck::OnBreak { until, just_started: false };
            }
            session.next_review_time = None;
        }

        let window = Duration::seconds(policy.review_session_window_secs);
        if now - session.window_start > window {
            session.session_reviews = 0;
            session.window_start = now;
        }

        if session.session_reviews >= policy.max_reviews_before_break {
            let until = now + Duration::seconds(policy.min_break_duration_secs);
            session.next_review_time = Some(until);
            session.session_reviews = 0;
            session.window_start = now;
            return BreakCheck::OnBreak { until, just_started: true };
        }

        session.session_reviews += 1;
        BreakCheck::Proceed
    }
}
