use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::billing_event::{BillingEvent, BillingEventType};
use crate::services::entitlements::{EntitlementError, ReconcileOutcome, Reconciler, RejectReason};
use crate::services::stripe::{StripeEvent, StripeServiceError, StripeWebhookService};

// Nested lookup; numeric segments index into arrays.
fn jget<'a>(val: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    let mut cur = val;
    for key in path {
        cur = match cur {
            serde_json::Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => cur.get(*key)?,
        };
    }
    Some(cur)
}

fn extract_str(val: &serde_json::Value, path: &[&str]) -> Option<String> {
    match jget(val, path)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        // Expanded references arrive as objects.
        serde_json::Value::Object(obj) => obj.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn extract_timestamp(val: &serde_json::Value, path: &[&str]) -> Option<OffsetDateTime> {
    let secs = jget(val, path)?.as_i64()?;
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

fn subscription_event(
    evt: &StripeEvent,
    event_type: BillingEventType,
    object: &serde_json::Value,
) -> BillingEvent {
    BillingEvent {
        event_id: evt.id.clone(),
        event_type,
        external_subscription_id: extract_str(object, &["id"]),
        external_customer_id: extract_str(object, &["customer"]),
        plan_id: extract_str(object, &["items", "data", "0", "price", "id"])
            .or_else(|| extract_str(object, &["plan", "id"])),
        period_end: extract_timestamp(object, &["current_period_end"])
            .or_else(|| extract_timestamp(object, &["items", "data", "0", "current_period_end"])),
    }
}

// The invoice's own `period_end` closes the previous billing period, so only
// the line item period can extend access.
fn invoice_event(evt: &StripeEvent, object: &serde_json::Value) -> BillingEvent {
    BillingEvent {
        event_id: evt.id.clone(),
        event_type: BillingEventType::InvoicePaid,
        external_subscription_id: extract_str(object, &["subscription"]),
        external_customer_id: extract_str(object, &["customer"]),
        plan_id: extract_str(object, &["lines", "data", "0", "price", "id"]),
        period_end: extract_timestamp(object, &["lines", "data", "0", "period", "end"]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderStatus {
    /// `active` or `trialing`.
    Entitled,
    /// Payment still outstanding. Stored state stands until Stripe settles it.
    Pending,
    Ended,
}

impl ProviderStatus {
    fn classify(status: Option<&str>) -> Self {
        match status {
            Some("active" | "trialing") => ProviderStatus::Entitled,
            Some("canceled" | "unpaid" | "incomplete_expired" | "paused") => {
                ProviderStatus::Ended
            }
            _ => ProviderStatus::Pending,
        }
    }
}

/// Maps a verified Stripe event onto a billing event. `None` for types and
/// subscription states that do not change entitlements.
pub fn billing_event_from_stripe(evt: &StripeEvent) -> Option<BillingEvent> {
    let object = jget(&evt.payload, &["data", "object"])?;
    let status = || ProviderStatus::classify(extract_str(object, &["status"]).as_deref());

    let event_type = match evt.r#type.as_str() {
        "customer.subscription.created" => match status() {
            ProviderStatus::Entitled => BillingEventType::SubscriptionActivated,
            ProviderStatus::Pending | ProviderStatus::Ended => return None,
        },
        "customer.subscription.updated" => match status() {
            ProviderStatus::Entitled => {
                // A subscription that only now became payable was never linked
                // on creation, so it has to resolve through the customer.
                let previous =
                    extract_str(&evt.payload, &["data", "previous_attributes", "status"])
                        .map(|prev| ProviderStatus::classify(Some(prev.as_str())));
                match previous {
                    Some(prev) if prev != ProviderStatus::Entitled => {
                        BillingEventType::SubscriptionActivated
                    }
                    _ => BillingEventType::SubscriptionUpdated,
                }
            }
            ProviderStatus::Ended => BillingEventType::SubscriptionCanceled,
            ProviderStatus::Pending => return None,
        },
        "customer.subscription.deleted" => BillingEventType::SubscriptionCanceled,
        "invoice.paid" | "invoice.payment_succeeded" => return Some(invoice_event(evt, object)),
        _ => return None,
    };
    Some(subscription_event(evt, event_type, object))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    Applied { user_id: Uuid },
    Duplicate,
    Ignored { event_type: String },
    Discarded(RejectReason),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Verification(#[from] StripeServiceError),
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

/// Any `Ok` disposition may be acknowledged to the provider; an `Err` other
/// than `Verification` should be left for redelivery.
pub struct BillingWebhookProcessor {
    stripe: Arc<dyn StripeWebhookService>,
    reconciler: Arc<Reconciler>,
}

impl BillingWebhookProcessor {
    pub fn new(stripe: Arc<dyn StripeWebhookService>, reconciler: Arc<Reconciler>) -> Self {
        Self { stripe, reconciler }
    }

    pub async fn process(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookDisposition, WebhookError> {
        let evt = match self.stripe.verify_webhook(payload, signature) {
            Ok(evt) => evt,
            Err(err) => {
                warn!(?err, "stripe webhook verification failed");
                return Err(err.into());
            }
        };

        let Some(event) = billing_event_from_stripe(&evt) else {
            debug!(event_id = %evt.id, event_type = %evt.r#type, "ignoring stripe event");
            return Ok(WebhookDisposition::Ignored {
                event_type: evt.r#type,
            });
        };

        let disposition = match self.reconciler.apply(&event).await? {
            ReconcileOutcome::Applied { user_id, .. } => WebhookDisposition::Applied { user_id },
            ReconcileOutcome::Duplicate => WebhookDisposition::Duplicate,
            ReconcileOutcome::Rejected(reason) => WebhookDisposition::Discarded(reason),
        };
        info!(event_id = %evt.id, event_type = %evt.r#type, ?disposition, "stripe webhook handled");
        Ok(disposition)
    }
}
