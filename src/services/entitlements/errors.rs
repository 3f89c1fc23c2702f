use uuid::Uuid;

use crate::db::transient::is_transient;

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("{operation} gave up after {attempts} attempt(s): {source}")]
    TransientStore {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl EntitlementError {
    /// Whether the caller may retry the whole check-and-act sequence.
    pub fn is_transient(&self) -> bool {
        match self {
            EntitlementError::TransientStore { .. } => true,
            EntitlementError::Store(err) => is_transient(err),
            EntitlementError::UserNotFound(_) => false,
        }
    }
}
