//! Idempotency Guard
//!
//! A settlement confirmation is identified by its natural key
//! (broker execution id, transaction time), not by queue delivery.
//! The check runs inside the caller's transaction; the unique index on
//! `executions` backs it up when two deliveries race.

use tracing::debug;

use super::types::IdempotencyKey;
use crate::store::{StoreError, StoreTx};

/// Whether an execution with `key` is already stored
pub async fn already_applied(
    tx: &mut dyn StoreTx,
    key: &IdempotencyKey,
) -> Result<bool, StoreError> {
    let existing = tx.find_execution(key).await?;
    if let Some(execution) = &existing {
        debug!(
            key = %key,
            execution_id = %execution.id,
            order_id = %execution.order_id,
            "Execution already applied"
        );
    }
    Ok(existing.is_some())
}
