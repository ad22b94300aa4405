//! Cancellation Reconciliation Engine
//!
//! The clearing broker could not honour a cancel. If the order never left
//! `accepted`, the local cancel is applied and announced. Otherwise the
//! order has since advanced, so it is left untouched and the client only
//! hears that the cancel was rejected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::consumer::{MessageHandler, Outcome, consume};
use super::error::ReconError;
use super::types::CancelRejectMessage;
use crate::core_types::{AccountId, OrderId};
use crate::failure::{FailureRecorder, TradeFailure};
use crate::models::OrderStatus;
use crate::notify::{EventPublisher, StreamEvent};
use crate::queue::Subscription;
use crate::store::Store;

pub struct CancelReconciler {
    queue: String,
    store: Arc<dyn Store>,
    recorder: Arc<FailureRecorder>,
    publisher: Arc<dyn EventPublisher>,
}

impl CancelReconciler {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn Store>,
        recorder: Arc<FailureRecorder>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            recorder,
            publisher,
        }
    }

    pub async fn run<S: Subscription>(&self, subscription: S, shutdown: watch::Receiver<bool>) {
        consume(self, subscription, shutdown).await
    }

    async fn reconcile(
        &self,
        msg: &CancelRejectMessage,
        account_hint: &mut Option<AccountId>,
    ) -> Result<Outcome, ReconError> {
        let mut tx = self.store.begin().await.map_err(ReconError::Database)?;

        let order = tx
            .get_order(msg.order_id)
            .await
            .map_err(ReconError::Database)?
            .ok_or_else(|| ReconError::OrderNotFound(msg.order_id.to_string()))?;
        *account_hint = Some(order.account_id);

        tx.lock_account(order.account_id)
            .await
            .map_err(ReconError::Database)?
            .ok_or_else(|| ReconError::AccountNotFound(order.account_id.to_string()))?;

        // Re-read under the account lock
        let mut order = tx
            .get_order(msg.order_id)
            .await
            .map_err(ReconError::Database)?
            .ok_or_else(|| ReconError::OrderNotFound(msg.order_id.to_string()))?;

        let now = Utc::now();
        let event = if order.status == OrderStatus::Accepted {
            order.mark_canceled(now);
            tx.save_order(&order)
                .await
                .map_err(|e| ReconError::Downstream(e.to_string()))?;
            StreamEvent::canceled(&order, now)
        } else {
            StreamEvent::cancel_rejected(&order, msg.reason.as_str(), now)
        };

        self.publisher.publish(order.account_id, &event).await?;
        tx.commit().await.map_err(ReconError::Commit)?;

        info!(
            account_id = %order.account_id,
            order_id = %order.id,
            status = %order.status,
            event = event.event.as_str(),
            reason = %msg.reason,
            "Cancel rejection reconciled"
        );
        Ok(Outcome::Applied)
    }

    async fn record(
        &self,
        payload: &[u8],
        error: &ReconError,
        account_id: Option<AccountId>,
        order_id: Option<OrderId>,
    ) {
        let Some(reason) = error.failure_reason() else {
            return;
        };
        let failure = TradeFailure::new(self.queue.as_str(), payload, reason, error.to_string())
            .with_account(account_id)
            .with_order(order_id);
        self.recorder.record(failure).await;
    }
}

#[async_trait]
impl MessageHandler for CancelReconciler {
    fn name(&self) -> &'static str {
        "cancel_reconciler"
    }

    async fn process(&self, payload: &[u8]) -> Result<Outcome, ReconError> {
        let msg: CancelRejectMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                let err = ReconError::Marshal(e.to_string());
                warn!(queue = %self.queue, error = %err, "Undecodable cancel rejection");
                self.record(payload, &err, None, None).await;
                return Err(err);
            }
        };

        let mut account_id = None;
        let result = self.reconcile(&msg, &mut account_id).await;
        if let Err(e) = &result {
            warn!(
                queue = %self.queue,
                order_id = %msg.order_id,
                account_id = ?account_id,
                code = e.code(),
                error = %e,
                "Cancel rejection reconciliation failed"
            );
            self.record(payload, e, account_id, Some(msg.order_id)).await;
        }
        result
    }
}
