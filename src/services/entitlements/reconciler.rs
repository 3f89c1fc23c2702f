use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use super::retry::{retry_transient, RetryPolicy};
use super::EntitlementError;
use crate::db::entitlement_repository::EntitlementRepository;
use crate::models::{
    billing_event::{BillingEvent, BillingEventType},
    entitlement::{EntitlementSnapshot, SnapshotUpdate},
};
use crate::utils::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No local user carries the event's customer / subscription id.
    UnknownSubscription { external_id: String },
    MissingField(&'static str),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownSubscription { external_id } => {
                write!(f, "no user matches external id {external_id}")
            }
            RejectReason::MissingField(field) => write!(f, "event is missing {field}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        user_id: Uuid,
        snapshot: EntitlementSnapshot,
    },
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Logged and dropped. Redelivering the same event will not change this.
    Rejected(RejectReason),
}

enum Lookup<'a> {
    Customer(&'a str),
    Subscription(&'a str),
}

impl Lookup<'_> {
    fn external_id(&self) -> &str {
        match self {
            Lookup::Customer(id) | Lookup::Subscription(id) => id,
        }
    }
}

/// Translation of one event into the lookup key and the snapshot write it implies.
struct EventPlan<'a> {
    lookup: Lookup<'a>,
    update: SnapshotUpdate,
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, RejectReason> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RejectReason::MissingField(field))
}

fn plan_event(event: &BillingEvent) -> Result<EventPlan<'_>, RejectReason> {
    // A blank id would collide with every other blank id in the event log.
    if event.event_id.trim().is_empty() {
        return Err(RejectReason::MissingField("eventId"));
    }

    match event.event_type {
        BillingEventType::SubscriptionActivated => {
            let customer_id = required(&event.external_customer_id, "externalCustomerId")?;
            let subscription_id =
                required(&event.external_subscription_id, "externalSubscriptionId")?;
            let plan_id = required(&event.plan_id, "planId")?;
            let period_end = event.period_end.ok_or(RejectReason::MissingField("periodEnd"))?;
            Ok(EventPlan {
                lookup: Lookup::Customer(customer_id),
                update: SnapshotUpdate {
                    is_active: Some(true),
                    plan_id: Some(plan_id.to_string()),
                    current_period_end: Some(period_end),
                    external_subscription_id: Some(subscription_id.to_string()),
                    ..Default::default()
                },
            })
        }
        BillingEventType::InvoicePaid => {
            let subscription_id =
                required(&event.external_subscription_id, "externalSubscriptionId")?;
            let period_end = event.period_end.ok_or(RejectReason::MissingField("periodEnd"))?;
            Ok(EventPlan {
                lookup: Lookup::Subscription(subscription_id),
                update: SnapshotUpdate {
                    current_period_end: Some(period_end),
                    ..Default::default()
                },
            })
        }
        BillingEventType::SubscriptionUpdated => {
            let subscription_id =
                required(&event.external_subscription_id, "externalSubscriptionId")?;
            let period_end = event.period_end.ok_or(RejectReason::MissingField("periodEnd"))?;
            Ok(EventPlan {
                lookup: Lookup::Subscription(subscription_id),
                update: SnapshotUpdate {
                    is_active: Some(true),
                    current_period_end: Some(period_end),
                    ..Default::default()
                },
            })
        }
        BillingEventType::SubscriptionCanceled => {
            let subscription_id =
                required(&event.external_subscription_id, "externalSubscriptionId")?;
            Ok(EventPlan {
                lookup: Lookup::Subscription(subscription_id),
                update: SnapshotUpdate {
                    is_active: Some(false),
                    current_period_end: event.period_end,
                    ..Default::default()
                },
            })
        }
    }
}

/// Applies provider events to the local snapshot. Writes are last-arrival-wins.
pub struct Reconciler {
    repo: Arc<dyn EntitlementRepository>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    event_retention: Duration,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        event_retention: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            retry,
            event_retention,
        }
    }

    /// Returns only after the snapshot write (if any) is committed, so the
    /// caller may acknowledge the delivery as soon as this resolves.
    pub async fn apply(&self, event: &BillingEvent) -> Result<ReconcileOutcome, EntitlementError> {
        let plan = match plan_event(event) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    %reason,
                    "discarding malformed billing event"
                );
                return Ok(ReconcileOutcome::Rejected(reason));
            }
        };

        retry_transient(self.retry, "apply_billing_event", || self.apply_once(event, &plan)).await
    }

    async fn apply_once(
        &self,
        event: &BillingEvent,
        plan: &EventPlan<'_>,
    ) -> Result<ReconcileOutcome, EntitlementError> {
        let mut tx = self.repo.begin().await?;

        if !tx
            .record_event(&event.event_id, event.event_type.as_str(), self.clock.now())
            .await?
        {
            tx.rollback().await?;
            info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "billing event already applied"
            );
            return Ok(ReconcileOutcome::Duplicate);
        }

        let user_id = match &plan.lookup {
            Lookup::Customer(id) => tx.find_user_by_external_customer_id(id).await?,
            Lookup::Subscription(id) => tx.find_user_by_external_subscription_id(id).await?,
        };

        let Some(user_id) = user_id else {
            // Rolling back also forgets the event id.
            tx.rollback().await?;
            let external_id = plan.lookup.external_id().to_string();
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                %external_id,
                "billing event references an unknown subscription"
            );
            return Ok(ReconcileOutcome::Rejected(
                RejectReason::UnknownSubscription { external_id },
            ));
        };

        let snapshot = tx.upsert_snapshot(user_id, &plan.update).await?;
        tx.commit().await?;

        info!(
            %user_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            is_active = snapshot.is_active,
            "applied billing event"
        );
        Ok(ReconcileOutcome::Applied { user_id, snapshot })
    }

    /// Stores the provider customer id so later activation events resolve to this user.
    pub async fn link_customer(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        retry_transient(self.retry, "link_customer", || {
            self.link_customer_once(user_id, customer_id)
        })
        .await
    }

    async fn link_customer_once(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let mut tx = self.repo.begin().await?;
        if !tx.user_exists(user_id).await? {
            tx.rollback().await?;
            return Err(EntitlementError::UserNotFound(user_id));
        }
        let update = SnapshotUpdate {
            external_customer_id: Some(customer_id.to_string()),
            ..Default::default()
        };
        let snapshot = tx.upsert_snapshot(user_id, &update).await?;
        tx.commit().await?;
        info!(%user_id, customer_id, "linked billing customer");
        Ok(snapshot)
    }

    /// Local reset after the subscription was cancelled with the provider.
    pub async fn clear_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, EntitlementError> {
        retry_transient(self.retry, "clear_subscription", || {
            self.clear_subscription_once(user_id)
        })
        .await
    }

    async fn clear_subscription_once(
        &self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, EntitlementError> {
        let mut tx = self.repo.begin().await?;
        if !tx.user_exists(user_id).await? {
            tx.rollback().await?;
            return Err(EntitlementError::UserNotFound(user_id));
        }
        let snapshot = tx.clear_subscription(user_id).await?;
        tx.commit().await?;
        info!(%user_id, "cleared local subscription");
        Ok(snapshot)
    }

    pub async fn prune_event_log(&self) -> Result<u64, EntitlementError> {
        let cutoff: OffsetDateTime = self.clock.now() - self.event_retention;
        let repo = &self.repo;
        let removed = retry_transient(self.retry, "prune_event_log", move || async move {
            Ok(repo.prune_processed_events(cutoff).await?)
        })
        .await?;
        info!(removed, %cutoff, "pruned billing event log");
        Ok(removed)
    }
}
