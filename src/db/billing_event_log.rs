use async_trait::async_trait;
use time::OffsetDateTime;

#[async_trait]
pub trait BillingEventLog: Send {
    /// Returns `false` when the id was already recorded by a committed (or
    /// concurrently committing) transaction. `processed_at` is what pruning
    /// later compares against.
    async fn record_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        processed_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error>;
}
