use std::sync::Arc;

use sqlx::postgres::{PgPool, PgPoolOptions};
use time::Duration;
use tracing::info;

use crate::config::Config;
use crate::db::{
    entitlement_repository::EntitlementRepository,
    postgres_entitlement_repository::PostgresEntitlementRepository,
};
use crate::models::plan::PlanCatalog;
use crate::services::billing_webhook::BillingWebhookProcessor;
use crate::services::entitlements::{EntitlementEvaluator, QuotaGuard, Reconciler, RetryPolicy};
use crate::services::stripe::{LiveStripeService, StripeWebhookService};
use crate::utils::clock::{Clock, SystemClock};

/// The entitlement services over one shared repository and clock.
#[derive(Clone)]
pub struct EntitlementState {
    pub evaluator: Arc<EntitlementEvaluator>,
    pub reconciler: Arc<Reconciler>,
    pub quota_guard: Arc<QuotaGuard>,
}

impl EntitlementState {
    pub fn new(
        repo: Arc<dyn EntitlementRepository>,
        catalog: PlanCatalog,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        event_retention: Duration,
    ) -> Self {
        let evaluator = Arc::new(EntitlementEvaluator::new(
            Arc::clone(&repo),
            Arc::new(catalog),
            Arc::clone(&clock),
            retry,
        ));
        let quota_guard = Arc::new(QuotaGuard::new(
            Arc::clone(&repo),
            Arc::clone(&evaluator),
            retry,
        ));
        let reconciler = Arc::new(Reconciler::new(repo, clock, retry, event_retention));

        Self {
            evaluator,
            reconciler,
            quota_guard,
        }
    }

    /// Wires the Postgres repository and system clock from `config`.
    pub fn from_pool(pool: PgPool, config: &Config) -> Self {
        let repo: Arc<dyn EntitlementRepository> = Arc::new(PostgresEntitlementRepository { pool });
        Self::new(
            repo,
            PlanCatalog::from_settings(&config.billing),
            Arc::new(SystemClock),
            RetryPolicy::from_settings(&config.store),
            Duration::days(config.billing.event_retention_days.max(0)),
        )
    }

    /// `None` when no webhook secret is configured.
    pub fn webhook_processor(&self, config: &Config) -> Option<BillingWebhookProcessor> {
        let stripe = config.stripe.as_ref()?;
        let service: Arc<dyn StripeWebhookService> =
            Arc::new(LiveStripeService::from_settings(stripe));
        Some(BillingWebhookProcessor::new(
            service,
            Arc::clone(&self.reconciler),
        ))
    }
}

pub async fn establish_connection(config: &Config) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections.max(1))
        .connect(&config.database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("connected to the database");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_entitlement_repository::MockEntitlementRepository;
    use crate::models::billing_event::{BillingEvent, BillingEventType};
    use crate::services::entitlements::{NoteDecision, ReconcileOutcome};
    use crate::utils::clock::ManualClock;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn services_share_one_repository() {
        let repo = MockEntitlementRepository::new();
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let state = EntitlementState::new(
            Arc::new(repo.clone()),
            PlanCatalog::new(1, 60),
            Arc::new(ManualClock::new(now)),
            RetryPolicy::default(),
            Duration::days(30),
        );
        let user_id = repo.register_user();

        assert!(matches!(
            state.quota_guard.try_consume_note(user_id).await.unwrap(),
            NoteDecision::Allowed { .. }
        ));
        assert_eq!(
            state.quota_guard.try_consume_note(user_id).await.unwrap(),
            NoteDecision::Denied
        );

        state.reconciler.link_customer(user_id, "cus_9").await.unwrap();
        let outcome = state
            .reconciler
            .apply(&BillingEvent {
                event_id: "evt_9".into(),
                event_type: BillingEventType::SubscriptionActivated,
                external_subscription_id: Some("sub_9".into()),
                external_customer_id: Some("cus_9".into()),
                plan_id: Some("price_9".into()),
                period_end: Some(now + Duration::days(30)),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));

        assert!(matches!(
            state.quota_guard.try_consume_note(user_id).await.unwrap(),
            NoteDecision::Allowed { note_count: 2 }
        ));
        assert!(state.evaluator.status(user_id).await.unwrap().is_subscribed);
    }
}
