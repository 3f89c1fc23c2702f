pub mod errors;
pub mod evaluator;
pub mod quota_guard;
pub mod reconciler;
mod retry;

pub use errors::EntitlementError;
pub use evaluator::{EntitlementEvaluator, SubscriptionStatus};
pub use quota_guard::{MeetingEnd, MeetingStart, NoteDecision, QuotaGuard};
pub use reconciler::{ReconcileOutcome, Reconciler, RejectReason};
pub use retry::RetryPolicy;
