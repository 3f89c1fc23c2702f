use async_trait::async_trait;
use time::OffsetDateTime;

use super::{
    billing_event_log::BillingEventLog, entitlement_store::EntitlementStore,
    usage_ledger::UsageLedger,
};

/// One unit of work over the ledger, the snapshot store and the event log.
/// Dropping it without `commit` rolls back.
#[async_trait]
pub trait EntitlementTransaction: UsageLedger + EntitlementStore + BillingEventLog {
    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error>;

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error>;
}

#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error>;

    /// Snapshot-isolated read; writes through it fail.
    async fn begin_read_only(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error>;

    async fn prune_processed_events(&self, older_than: OffsetDateTime)
        -> Result<u64, sqlx::Error>;
}
