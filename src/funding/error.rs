//! Funding Error Types

use thiserror::Error;

use crate::clients::{AggregatorError, BrokerError};
use crate::core_types::{AccountId, RelationshipId};
use crate::store::StoreError;

/// Failure of one sweep row. Every variant leaves the row unchanged for
/// the next sweep.
#[derive(Error, Debug)]
pub enum FundingError {
    #[error("Database error: {0}")]
    Store(#[from] StoreError),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Relationship not found: {0}")]
    RelationshipNotFound(RelationshipId),

    #[error("Clearing broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Bank aggregator error: {0}")]
    Aggregator(#[from] AggregatorError),
}

impl FundingError {
    pub fn code(&self) -> &'static str {
        match self {
            FundingError::Store(e) => e.code(),
            FundingError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            FundingError::RelationshipNotFound(_) => "RELATIONSHIP_NOT_FOUND",
            FundingError::Broker(e) => e.code(),
            FundingError::Aggregator(e) => e.code(),
        }
    }
}
