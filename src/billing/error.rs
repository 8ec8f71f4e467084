use thiserror::Error;
use uuid::Uuid;

/// key: billing-errors -> store and ledger failures
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("rate limit counters unavailable")]
    CountersUnavailable,
    #[error("account {0} not found")]
    AccountNotFound(Uuid),
    #[error("credit amount must be {expected}, got {actual}")]
    InvalidAmount { expected: &'static str, actual: i64 },
}

impl BillingError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::StoreUnavailable(_) | BillingError::CountersUnavailable
        )
    }
}
