use super::{StripeEvent, StripeServiceError, StripeWebhookService};

/// Verifies `Stripe-Signature` headers against the endpoint's signing secret.
#[derive(Clone)]
pub struct LiveStripeService {
    webhook_secret: String,
}

impl LiveStripeService {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(settings.webhook_secret.clone())
    }
}

impl StripeWebhookService for LiveStripeService {
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        if self.webhook_secret.is_empty() {
            return Err(StripeServiceError::Config(
                "webhook secret is empty".to_string(),
            ));
        }
        let payload_str =
            std::str::from_utf8(payload).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        let event =
            stripe::Webhook::construct_event(payload_str, signature_header, &self.webhook_secret)?;
        let payload =
            serde_json::to_value(&event).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        Ok(StripeEvent {
            id: event.id.to_string(),
            r#type: event.type_.to_string(),
            payload,
        })
    }
}
