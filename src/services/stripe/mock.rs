use super::{StripeEvent, StripeServiceError, StripeWebhookService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Accepts any signature and parses the payload as-is, unless told to reject.
#[derive(Clone, Default)]
pub struct MockStripeService {
    pub verified: Arc<Mutex<Vec<StripeEvent>>>,
    reject: Arc<AtomicBool>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_signatures(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

fn make_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

impl StripeWebhookService for MockStripeService {
    fn verify_webhook(
        &self,
        payload: &[u8],
        _signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(StripeServiceError::Webhook("signature mismatch".into()));
        }
        let val: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        let id = val
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| make_id("evt"));
        let ty = val
            .get("type")
            .or_else(|| val.get("type_"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let evt = StripeEvent {
            id,
            r#type: ty,
            payload: val,
        };
        self.verified.lock().unwrap().push(evt.clone());
        Ok(evt)
    }
}
