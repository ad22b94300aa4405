//! Order Reconciliation Engine
//!
//! Applies settlement confirmations from the execution queue to orders
//! and positions. One message is one transaction:
//!
//! ```text
//! decode → self-test? → begin → duplicate? → lock account → insert execution
//!        → update order + position → publish event → email on fill → commit
//! ```
//!
//! Publishing and email dispatch happen before commit, so a failure in
//! either rolls the update back and the message is redelivered.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::consumer::{MessageHandler, Outcome, consume};
use super::error::ReconError;
use super::idempotency;
use super::liveness::Liveness;
use super::types::{Execution, ExecutionMessage, ExecutionType};
use crate::core_types::{AccountId, OrderId};
use crate::failure::{FailureRecorder, TradeFailure};
use crate::notify::{EventPublisher, Notification, Notifier, StreamEvent};
use crate::queue::Subscription;
use crate::store::{Store, StoreError};

/// Best-effort failure linkage, filled in as processing learns more
#[derive(Debug, Default, Clone, Copy)]
struct Linkage {
    account_id: Option<AccountId>,
    order_id: Option<OrderId>,
}

pub struct OrderReconciler {
    queue: String,
    store: Arc<dyn Store>,
    recorder: Arc<FailureRecorder>,
    publisher: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
    liveness: Arc<Liveness>,
}

impl OrderReconciler {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn Store>,
        recorder: Arc<FailureRecorder>,
        publisher: Arc<dyn EventPublisher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            recorder,
            publisher,
            notifier,
            liveness: Arc::new(Liveness::new()),
        }
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        self.liveness.clone()
    }

    pub async fn run<S: Subscription>(&self, subscription: S, shutdown: watch::Receiver<bool>) {
        consume(self, subscription, shutdown).await
    }

    async fn reconcile(
        &self,
        msg: &ExecutionMessage,
        order_id: OrderId,
        link: &mut Linkage,
    ) -> Result<Outcome, ReconError> {
        let key = msg.idempotency_key();
        let mut tx = self.store.begin().await.map_err(ReconError::Database)?;

        if idempotency::already_applied(tx.as_mut(), &key)
            .await
            .map_err(ReconError::Database)?
        {
            tx.commit().await.map_err(ReconError::Commit)?;
            info!(key = %key, order_id = %order_id, "Duplicate execution skipped");
            return Ok(Outcome::Duplicate);
        }

        let account = tx
            .lock_account_by_broker_id(&msg.account)
            .await
            .map_err(ReconError::Database)?
            .ok_or_else(|| ReconError::AccountNotFound(msg.account.clone()))?;
        link.account_id = Some(account.id);
        link.order_id = Some(order_id);

        let execution = Execution::from_message(msg, order_id, account.id);
        match tx.insert_execution(&execution).await {
            Ok(()) => {}
            // Lost a race with a concurrent delivery of the same message
            Err(StoreError::Duplicate(_)) => {
                info!(key = %key, order_id = %order_id, "Duplicate execution skipped");
                return Ok(Outcome::Duplicate);
            }
            Err(e) => return Err(ReconError::Database(e)),
        }

        let mut order = tx
            .get_order(order_id)
            .await
            .map_err(|e| ReconError::Downstream(e.to_string()))?
            .ok_or_else(|| ReconError::Downstream(format!("order {} not found", order_id)))?;
        if order.account_id != account.id {
            return Err(ReconError::Downstream(format!(
                "order {} does not belong to account {}",
                order_id, account.id
            )));
        }

        order
            .apply(&execution)
            .map_err(|e| ReconError::Downstream(e.to_string()))?;
        tx.save_order(&order)
            .await
            .map_err(|e| ReconError::Downstream(e.to_string()))?;

        if execution.exec_type.is_fill() {
            let position = tx
                .apply_position(&execution)
                .await
                .map_err(|e| ReconError::Downstream(e.to_string()))?;
            debug!(
                account_id = %account.id,
                symbol = %position.symbol,
                qty = %position.qty,
                avg_entry_price = %position.avg_entry_price,
                "Position updated"
            );
        }

        self.publisher
            .publish(account.id, &StreamEvent::execution(&execution, &order))
            .await?;

        if execution.exec_type == ExecutionType::Fill {
            self.notifier
                .notify(
                    &account,
                    Notification::OrderFilled {
                        order_id,
                        symbol: order.symbol.clone(),
                        qty: order.filled_qty,
                        price: order.filled_avg_price.unwrap_or(execution.price),
                    },
                )
                .await?;
        }

        tx.commit().await.map_err(ReconError::Commit)?;

        info!(
            account_id = %account.id,
            order_id = %order_id,
            broker_exec_id = %execution.broker_exec_id,
            exec_type = %execution.exec_type,
            status = %order.status,
            filled_qty = %order.filled_qty,
            "Execution applied"
        );
        Ok(Outcome::Applied)
    }

    async fn record(&self, payload: &[u8], error: &ReconError, link: Linkage) {
        let Some(reason) = error.failure_reason() else {
            return;
        };
        let failure = TradeFailure::new(self.queue.as_str(), payload, reason, error.to_string())
            .with_account(link.account_id)
            .with_order(link.order_id);
        self.recorder.record(failure).await;
    }
}

#[async_trait]
impl MessageHandler for OrderReconciler {
    fn name(&self) -> &'static str {
        "order_reconciler"
    }

    async fn process(&self, payload: &[u8]) -> Result<Outcome, ReconError> {
        let msg: ExecutionMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                let err = ReconError::Marshal(e.to_string());
                warn!(queue = %self.queue, error = %err, "Undecodable execution message");
                self.record(payload, &err, Linkage::default()).await;
                return Err(err);
            }
        };

        if msg.is_self_test() {
            self.liveness.beat();
            debug!(count = self.liveness.count(), "Self-test message received");
            return Ok(Outcome::SelfTest);
        }

        let order_id: OrderId = match msg.order_id.parse() {
            Ok(id) => id,
            Err(e) => {
                let err = ReconError::Marshal(format!("order_id {:?}: {}", msg.order_id, e));
                warn!(queue = %self.queue, error = %err, "Undecodable execution message");
                self.record(payload, &err, Linkage::default()).await;
                return Err(err);
            }
        };

        let mut link = Linkage::default();
        // The transaction is dropped (rolled back) before the failure is recorded
        let result = self.reconcile(&msg, order_id, &mut link).await;
        if let Err(e) = &result {
            warn!(
                queue = %self.queue,
                account_id = ?link.account_id,
                order_id = %order_id,
                broker_exec_id = %msg.broker_exec_id,
                code = e.code(),
                error = %e,
                "Execution reconciliation failed"
            );
            self.record(payload, e, link).await;
        }
        result
    }
}
