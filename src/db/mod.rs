pub mod billing_event_log;
pub mod entitlement_repository;
pub mod entitlement_store;
pub mod mock_entitlement_repository;
pub mod postgres_entitlement_repository;
pub mod transient;
pub mod usage_ledger;
