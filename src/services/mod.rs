pub mod billing_webhook;
pub mod entitlements;
pub mod stripe;
