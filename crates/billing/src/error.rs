//! Billing error types

use streamline_shared::ParseEnumError;

use crate::upgrade::UpgradeInputError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Subscription exists but is not in a state that can be upgraded
    #[error("Cannot price upgrade: invalid subscription state ({0})")]
    InvalidSubscriptionState(String),

    #[error("Cannot price upgrade: {0}")]
    InvalidUpgradeInput(#[from] UpgradeInputError),

    /// The pricing engine rejected the requested transition
    #[error("{0}")]
    UpgradeRejected(String),

    #[error("An upgrade order is already awaiting payment for this subscription")]
    UpgradeAlreadyPending,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Invalid order state: {0}")]
    InvalidOrderState(String),

    /// A stored row carries a value outside the known vocabulary
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(e: ParseEnumError) -> Self {
        BillingError::CorruptRecord(e.to_string())
    }
}
