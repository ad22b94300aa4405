//! Reconciliation Error Types

use thiserror::Error;

use crate::failure::FailureReason;
use crate::notify::{NotifyError, PublishError};
use crate::store::StoreError;

/// Why one queue message could not be reconciled
///
/// Variants are named by the processing stage that failed, which is what
/// decides the failure record's reason code.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Malformed message: {0}")]
    Marshal(String),

    #[error("Database error: {0}")]
    Database(StoreError),

    #[error("Account not found for broker account {0}")]
    AccountNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order update failed: {0}")]
    Downstream(String),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Notification dispatch failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("Commit failed: {0}")]
    Commit(StoreError),
}

impl ReconError {
    pub fn code(&self) -> &'static str {
        match self {
            ReconError::Marshal(_) => "MARSHAL",
            ReconError::Database(_) => "DATABASE",
            ReconError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            ReconError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            ReconError::Downstream(_) => "DOWNSTREAM",
            ReconError::Publish(_) => "PUBLISH_FAILED",
            ReconError::Notify(_) => "NOTIFY_FAILED",
            ReconError::Commit(_) => "COMMIT_FAILED",
        }
    }

    /// Reason code for the failure record, `None` when the message is
    /// only redelivered (publish / notify / commit fail after the order
    /// update was already valid)
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ReconError::Marshal(_) => Some(FailureReason::Marshal),
            ReconError::Database(_)
            | ReconError::AccountNotFound(_)
            | ReconError::OrderNotFound(_) => Some(FailureReason::Database),
            ReconError::Downstream(_) => Some(FailureReason::Downstream),
            ReconError::Publish(_) | ReconError::Notify(_) | ReconError::Commit(_) => None,
        }
    }
}
