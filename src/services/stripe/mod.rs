// async-stripe is only used for signature verification here; its feature set in Cargo.toml pulls
// in the webhook payload types and nothing from the REST client is called.
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("webhook verification failed: {0}")]
    Webhook(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<stripe::WebhookError> for StripeServiceError {
    fn from(err: stripe::WebhookError) -> Self {
        StripeServiceError::Webhook(err.to_string())
    }
}

/// A verified provider event. `payload` is the full event object as JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    pub r#type: String,
    pub payload: serde_json::Value,
}

pub trait StripeWebhookService: Send + Sync {
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError>;
}

mod live;
mod mock;

pub use live::LiveStripeService;
pub use mock::MockStripeService;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_verify_webhook_invalid_signature_maps_to_webhook_error() {
        let live = LiveStripeService::new("whsec_test");
        let payload = br#"{ "id": "evt_123", "type": "invoice.paid" }"#;
        let result = live.verify_webhook(payload, "t=1,v1=invalidsignature");
        assert!(matches!(result, Err(StripeServiceError::Webhook(_))));
    }

    #[test]
    fn live_verify_webhook_rejects_non_utf8_payload() {
        let live = LiveStripeService::new("whsec_test");
        let result = live.verify_webhook(&[0xff, 0xfe], "t=1,v1=sig");
        assert!(matches!(result, Err(StripeServiceError::Serde(_))));
    }

    #[test]
    fn mock_parses_payload_and_honours_rejection() {
        let mock = MockStripeService::new();
        let evt = mock
            .verify_webhook(br#"{ "id": "evt_1", "type": "invoice.paid" }"#, "sig")
            .unwrap();
        assert_eq!(evt.id, "evt_1");
        assert_eq!(evt.r#type, "invoice.paid");
        assert_eq!(mock.verified.lock().unwrap().len(), 1);

        mock.reject_signatures(true);
        assert!(matches!(
            mock.verify_webhook(br#"{ "id": "evt_2" }"#, "sig"),
            Err(StripeServiceError::Webhook(_))
        ));
    }

    #[test]
    fn mock_assigns_distinct_ids_to_payloads_without_one() {
        let mock = MockStripeService::new();
        let first = mock
            .verify_webhook(br#"{ "type": "invoice.paid" }"#, "sig")
            .unwrap();
        let second = mock
            .verify_webhook(br#"{ "id": "", "type": "invoice.paid" }"#, "sig")
            .unwrap();
        assert!(first.id.starts_with("evt_"));
        assert!(second.id.starts_with("evt_"));
        assert_ne!(first.id, second.id);
    }
}
