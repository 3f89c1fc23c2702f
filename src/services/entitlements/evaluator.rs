use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::retry::{retry_transient, RetryPolicy};
use super::EntitlementError;
use crate::db::entitlement_repository::EntitlementRepository;
use crate::models::{
    allowance::{Allowance, MeetingAllowance},
    entitlement::EntitlementSnapshot,
    plan::PlanCatalog,
    usage::UsageCounters,
};
use crate::utils::clock::Clock;

/// What a subscription page shows: current plan, usage and the free-tier limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub is_subscribed: bool,
    pub is_active: bool,
    pub plan_id: Option<String>,
    pub plan_name: &'static str,
    #[serde(with = "time::serde::timestamp::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub note_count: i64,
    pub meeting_seconds_used: i64,
    pub note_limit: i64,
    pub meeting_limit_seconds: i64,
    pub remaining_meeting_seconds: MeetingAllowance,
}

pub struct EntitlementEvaluator {
    repo: Arc<dyn EntitlementRepository>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl EntitlementEvaluator {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            catalog,
            clock,
            retry,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Pure allowance computation. A missing snapshot is an unsubscribed user.
    pub fn assess(
        &self,
        snapshot: Option<&EntitlementSnapshot>,
        counters: &UsageCounters,
        now: OffsetDateTime,
    ) -> Allowance {
        let is_subscribed = snapshot
            .map(|s| s.is_effectively_active(now))
            .unwrap_or(false);

        if is_subscribed {
            return Allowance {
                is_subscribed,
                note_limit_exceeded: false,
                remaining_meeting_seconds: MeetingAllowance::Unlimited,
            };
        }

        let remaining = self
            .catalog
            .free_meeting_seconds()
            .saturating_sub(counters.meeting_seconds_used)
            .max(0);

        Allowance {
            is_subscribed,
            note_limit_exceeded: counters.note_count >= self.catalog.free_note_limit(),
            remaining_meeting_seconds: MeetingAllowance::Seconds(remaining),
        }
    }

    pub async fn evaluate(&self, user_id: Uuid) -> Result<Allowance, EntitlementError> {
        let (snapshot, counters) = self.read_consistent(user_id).await?;
        let allowance = self.assess(snapshot.as_ref(), &counters, self.clock.now());
        debug!(
            %user_id,
            is_subscribed = allowance.is_subscribed,
            note_limit_exceeded = allowance.note_limit_exceeded,
            "evaluated entitlement"
        );
        Ok(allowance)
    }

    pub async fn status(&self, user_id: Uuid) -> Result<SubscriptionStatus, EntitlementError> {
        let (snapshot, counters) = self.read_consistent(user_id).await?;
        let allowance = self.assess(snapshot.as_ref(), &counters, self.clock.now());
        let snapshot = snapshot.unwrap_or_else(|| EntitlementSnapshot::inactive(user_id));

        Ok(SubscriptionStatus {
            is_subscribed: allowance.is_subscribed,
            is_active: snapshot.is_active,
            plan_name: self.catalog.plan_name(snapshot.plan_id.as_deref()),
            plan_id: snapshot.plan_id,
            current_period_end: snapshot.current_period_end,
            note_count: counters.note_count,
            meeting_seconds_used: counters.meeting_seconds_used,
            note_limit: self.catalog.free_note_limit(),
            meeting_limit_seconds: self.catalog.free_meeting_seconds(),
            remaining_meeting_seconds: allowance.remaining_meeting_seconds,
        })
    }

    async fn read_consistent(
        &self,
        user_id: Uuid,
    ) -> Result<(Option<EntitlementSnapshot>, UsageCounters), EntitlementError> {
        retry_transient(self.retry, "evaluate_entitlement", || self.read_once(user_id)).await
    }

    async fn read_once(
        &self,
        user_id: Uuid,
    ) -> Result<(Option<EntitlementSnapshot>, UsageCounters), EntitlementError> {
        let mut tx = self.repo.begin_read_only().await?;
        if !tx.user_exists(user_id).await? {
            tx.rollback().await?;
            return Err(EntitlementError::UserNotFound(user_id));
        }
        let snapshot = tx.get_snapshot(user_id).await?;
        let counters = tx.get_counters(user_id).await?;
        tx.commit().await?;
        Ok((snapshot, counters))
    }
}
