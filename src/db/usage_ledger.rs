use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::usage::UsageCounters;

/// Per-user usage counters, always accessed through an open transaction.
#[async_trait]
pub trait UsageLedger: Send {
    /// Plain read; a user without a row has zero usage.
    async fn get_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error>;

    /// Creates the row if needed and holds its lock until the transaction ends.
    async fn lock_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error>;

    async fn increment_note_count(&mut self, user_id: Uuid) -> Result<i64, sqlx::Error>;

    async fn set_meeting_start(
        &mut self,
        user_id: Uuid,
        started_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    async fn clear_meeting_start(&mut self, user_id: Uuid) -> Result<(), sqlx::Error>;

    async fn add_meeting_seconds(&mut self, user_id: Uuid, delta: i64) -> Result<i64, sqlx::Error>;
}
