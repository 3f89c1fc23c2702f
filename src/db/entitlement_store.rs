use async_trait::async_trait;
use uuid::Uuid;

use crate::models::entitlement::{EntitlementSnapshot, SnapshotUpdate};

#[async_trait]
pub trait EntitlementStore: Send {
    async fn user_exists(&mut self, user_id: Uuid) -> Result<bool, sqlx::Error>;

    async fn get_snapshot(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error>;

    async fn upsert_snapshot(
        &mut self,
        user_id: Uuid,
        update: &SnapshotUpdate,
    ) -> Result<EntitlementSnapshot, sqlx::Error>;

    /// Drops plan, period and subscription id; the customer id is kept.
    async fn clear_subscription(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error>;

    async fn find_user_by_external_customer_id(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn find_user_by_external_subscription_id(
        &mut self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;
}
