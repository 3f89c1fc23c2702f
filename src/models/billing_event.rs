use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BillingEventType {
    SubscriptionActivated,
    InvoicePaid,
    SubscriptionUpdated,
    SubscriptionCanceled,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionActivated => "subscriptionActivated",
            BillingEventType::InvoicePaid => "invoicePaid",
            BillingEventType::SubscriptionUpdated => "subscriptionUpdated",
            BillingEventType::SubscriptionCanceled => "subscriptionCanceled",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider notification, already verified and decoded by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    pub event_id: String,
    pub event_type: BillingEventType,
    #[serde(default)]
    pub external_subscription_id: Option<String>,
    #[serde(default)]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Unix seconds on the wire.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub period_end: Option<OffsetDateTime>,
}
