pub mod allowance;
pub mod billing_event;
pub mod entitlement;
pub mod plan;
pub mod usage;
