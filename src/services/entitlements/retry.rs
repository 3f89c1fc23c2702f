use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

use super::EntitlementError;
use crate::config::StoreSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&StoreSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.retry_backoff,
        }
    }
}

/// Re-runs `op` from scratch while it fails with a transient store error.
/// Anything else is returned to the caller as is.
pub(crate) async fn retry_transient<T, Fut, F>(
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, EntitlementError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EntitlementError>>,
{
    let mut attempt = 0usize;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(EntitlementError::Store(err)) if crate::db::transient::is_transient(&err) => {
                if attempt < policy.max_attempts {
                    warn!(operation, attempt, ?err, "store transaction failed; retrying");
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    continue;
                }
                error!(operation, attempt, ?err, "store transaction exhausted retries");
                return Err(EntitlementError::TransientStore {
                    operation,
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => return Err(err),
        }
    }
}
