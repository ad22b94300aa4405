//! Failure Recorder
//!
//! Inserts run under `REPEATABLE READ`. A serialization conflict retries the
//! same insert until it lands; any other error is logged and the record is
//! dropped.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::types::TradeFailure;
use crate::store::{Isolation, Store, StoreError};

pub struct FailureRecorder {
    store: Arc<dyn Store>,
}

impl FailureRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist `failure`. Returns whether it was stored.
    pub async fn record(&self, failure: TradeFailure) -> bool {
        let mut conflicts = 0u64;
        loop {
            match self.try_insert(&failure).await {
                Ok(()) => {
                    info!(
                        failure_id = %failure.id,
                        queue = %failure.queue,
                        reason = %failure.reason,
                        account_id = ?failure.account_id,
                        order_id = ?failure.order_id,
                        error = %failure.error,
                        "Trade failure recorded"
                    );
                    return true;
                }
                Err(e) if e.is_serialization_conflict() => {
                    conflicts += 1;
                    warn!(
                        failure_id = %failure.id,
                        attempt = conflicts,
                        "Serialization conflict recording trade failure, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        failure_id = %failure.id,
                        queue = %failure.queue,
                        reason = %failure.reason,
                        code = e.code(),
                        error = %e,
                        payload = %failure.payload,
                        "Dropping trade failure"
                    );
                    return false;
                }
            }
        }
    }

    async fn try_insert(&self, failure: &TradeFailure) -> Result<(), StoreError> {
        let mut tx = self.store.begin_with(Isolation::RepeatableRead).await?;
        tx.insert_trade_failure(failure).await?;
        tx.commit().await
    }
}
