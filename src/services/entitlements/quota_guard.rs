use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::evaluator::EntitlementEvaluator;
use super::retry::{retry_transient, RetryPolicy};
use super::EntitlementError;
use crate::db::entitlement_repository::{EntitlementRepository, EntitlementTransaction};
use crate::models::{allowance::Allowance, usage::UsageCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteDecision {
    Allowed { note_count: i64 },
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStart {
    Started { started_at: OffsetDateTime },
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingEnd {
    Ended {
        duration_seconds: i64,
        meeting_seconds_used: i64,
    },
    NoOpenSession,
}

/// Check-and-consume for metered actions. Each call is one transaction that
/// holds the user's counter row lock from the read through the write.
pub struct QuotaGuard {
    repo: Arc<dyn EntitlementRepository>,
    evaluator: Arc<EntitlementEvaluator>,
    retry: RetryPolicy,
}

impl QuotaGuard {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        evaluator: Arc<EntitlementEvaluator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            evaluator,
            retry,
        }
    }

    pub async fn try_consume_note(&self, user_id: Uuid) -> Result<NoteDecision, EntitlementError> {
        retry_transient(self.retry, "consume_note", || self.consume_note_once(user_id)).await
    }

    pub async fn start_meeting(&self, user_id: Uuid) -> Result<MeetingStart, EntitlementError> {
        retry_transient(self.retry, "start_meeting", || self.start_meeting_once(user_id)).await
    }

    pub async fn end_meeting(&self, user_id: Uuid) -> Result<MeetingEnd, EntitlementError> {
        retry_transient(self.retry, "end_meeting", || self.end_meeting_once(user_id)).await
    }

    /// Opens a transaction with the counter row locked. Missing users are
    /// rejected before any row is created for them.
    async fn lock(
        &self,
        user_id: Uuid,
    ) -> Result<(Box<dyn EntitlementTransaction>, UsageCounters), EntitlementError> {
        let mut tx = self.repo.begin().await?;
        if !tx.user_exists(user_id).await? {
            tx.rollback().await?;
            return Err(EntitlementError::UserNotFound(user_id));
        }
        let counters = tx.lock_counters(user_id).await?;
        Ok((tx, counters))
    }

    async fn assess_locked(
        &self,
        tx: &mut Box<dyn EntitlementTransaction>,
        user_id: Uuid,
        counters: &UsageCounters,
        now: OffsetDateTime,
    ) -> Result<Allowance, EntitlementError> {
        let snapshot = tx.get_snapshot(user_id).await?;
        Ok(self.evaluator.assess(snapshot.as_ref(), counters, now))
    }

    async fn consume_note_once(&self, user_id: Uuid) -> Result<NoteDecision, EntitlementError> {
        let (mut tx, counters) = self.lock(user_id).await?;
        let now = self.evaluator.now();
        let allowance = self.assess_locked(&mut tx, user_id, &counters, now).await?;

        if allowance.note_limit_exceeded {
            tx.rollback().await?;
            info!(%user_id, note_count = counters.note_count, "note quota denied");
            return Ok(NoteDecision::Denied);
        }

        let note_count = tx.increment_note_count(user_id).await?;
        tx.commit().await?;
        info!(%user_id, note_count, "note quota consumed");
        Ok(NoteDecision::Allowed { note_count })
    }

    async fn start_meeting_once(&self, user_id: Uuid) -> Result<MeetingStart, EntitlementError> {
        let (mut tx, counters) = self.lock(user_id).await?;
        let now = self.evaluator.now();
        let allowance = self.assess_locked(&mut tx, user_id, &counters, now).await?;

        if !allowance.is_subscribed && allowance.remaining_meeting_seconds.is_exhausted() {
            tx.rollback().await?;
            info!(
                %user_id,
                meeting_seconds_used = counters.meeting_seconds_used,
                "meeting quota denied"
            );
            return Ok(MeetingStart::Denied);
        }

        if let Some(previous) = counters.last_meeting_start {
            warn!(%user_id, %previous, "overwriting open meeting session");
        }

        tx.set_meeting_start(user_id, now).await?;
        tx.commit().await?;
        info!(%user_id, started_at = %now, "meeting started");
        Ok(MeetingStart::Started { started_at: now })
    }

    async fn end_meeting_once(&self, user_id: Uuid) -> Result<MeetingEnd, EntitlementError> {
        let (mut tx, counters) = self.lock(user_id).await?;
        let now = self.evaluator.now();

        let Some(started_at) = counters.last_meeting_start else {
            tx.rollback().await?;
            info!(%user_id, "no open meeting session to end");
            return Ok(MeetingEnd::NoOpenSession);
        };

        // Clock skew can put the start in the future.
        let duration_seconds = (now - started_at).whole_seconds().max(0);
        let meeting_seconds_used = tx.add_meeting_seconds(user_id, duration_seconds).await?;
        tx.clear_meeting_start(user_id).await?;
        tx.commit().await?;

        info!(%user_id, duration_seconds, meeting_seconds_used, "meeting ended");
        Ok(MeetingEnd::Ended {
            duration_seconds,
            meeting_seconds_used,
        })
    }
}
