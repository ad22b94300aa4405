//! Integration tests for the reconciliation engines
//!
//! Drive both engines end-to-end against the in-memory store with
//! recording publisher / notifier.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::watch;

use super::cancel::CancelReconciler;
use super::consumer::{MessageHandler, Outcome};
use super::engine::OrderReconciler;
use super::error::ReconError;
use super::types::SELF_TEST_ORDER_ID;
use crate::core_types::AccountId;
use crate::failure::{FailureReason, FailureRecorder};
use crate::models::{Account, AccountStatus, Order, OrderStatus, Side};
use crate::notify::EventKind;
use crate::notify::mock::{RecordingNotifier, RecordingPublisher};
use crate::queue::ChannelQueue;
use crate::store::{MemoryStore, Store};

const BROKER_ACCOUNT: &str = "BRK-1001";

struct TestHarness {
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    notifier: Arc<RecordingNotifier>,
    orders: Arc<OrderReconciler>,
    cancels: CancelReconciler,
    account: Account,
    order: Order,
}

impl TestHarness {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let recorder = Arc::new(FailureRecorder::new(dyn_store.clone()));

        let orders = Arc::new(OrderReconciler::new(
            "executions",
            dyn_store.clone(),
            recorder.clone(),
            publisher.clone(),
            notifier.clone(),
        ));
        let cancels = CancelReconciler::new(
            "cancel_rejections",
            dyn_store,
            recorder,
            publisher.clone(),
        );

        let account = Account {
            id: AccountId::new(),
            broker_account_id: BROKER_ACCOUNT.to_string(),
            status: AccountStatus::Active,
            email: Some("ada@example.com".to_string()),
            given_name: Some("Ada".to_string()),
        };
        let order = Order::accepted(account.id, "AAPL", Side::Buy, dec!(10));
        store.insert_account(account.clone()).await;
        store.insert_order(order.clone()).await;

        Self {
            store,
            publisher,
            notifier,
            orders,
            cancels,
            account,
            order,
        }
    }

    async fn order_now(&self) -> Order {
        self.store.snapshot().await.orders[&self.order.id].clone()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_709_303_400 + secs, 250_000_000).unwrap()
}

fn execution_msg(
    order: &Order,
    exec_id: &str,
    exec_type: &str,
    qty: Decimal,
    price: Decimal,
    time: DateTime<Utc>,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "order_id": order.id.to_string(),
        "account": BROKER_ACCOUNT,
        "side": "buy",
        "qty": qty.to_string(),
        "price": price.to_string(),
        "transaction_time": time.to_rfc3339(),
        "broker_exec_id": exec_id,
        "type": exec_type,
        "symbol": order.symbol,
    }))
    .unwrap()
}

fn cancel_reject_msg(order: &Order, reason: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({"order_id": order.id.to_string(), "reason": reason})).unwrap()
}

// ============================================================================
// Order reconciliation: happy path & idempotence
// ============================================================================

#[tokio::test]
async fn test_fill_updates_order_position_and_notifies() {
    let h = TestHarness::new().await;
    let msg = execution_msg(&h.order, "X-1", "fill", dec!(10), dec!(187.5), at(0));

    let outcome = h.orders.process(&msg).await.unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let state = h.store.snapshot().await;
    let order = &state.orders[&h.order.id];
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_qty, dec!(10));
    assert_eq!(order.filled_avg_price, Some(dec!(187.5)));
    assert_eq!(state.executions.len(), 1);

    let position = &state.positions[&(h.account.id, "AAPL".to_string())];
    assert_eq!(position.qty, dec!(10));
    assert_eq!(position.avg_entry_price, dec!(187.5));

    let events = h.publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, h.account.id);
    assert_eq!(events[0].1.event, EventKind::Fill);
    assert_eq!(events[0].1.price, Some(dec!(187.5)));

    assert_eq!(h.notifier.kinds(), vec!["order_filled"]);
    assert!(state.failures.is_empty());
}

#[tokio::test]
async fn test_duplicate_execution_applied_once() {
    let h = TestHarness::new().await;
    let msg = execution_msg(&h.order, "X-1", "partial_fill", dec!(4), dec!(100), at(0));

    assert_eq!(h.orders.process(&msg).await.unwrap(), Outcome::Applied);
    assert_eq!(h.orders.process(&msg).await.unwrap(), Outcome::Duplicate);

    let state = h.store.snapshot().await;
    assert_eq!(state.executions.len(), 1);
    assert_eq!(state.orders[&h.order.id].filled_qty, dec!(4));
    assert_eq!(h.publisher.count(), 1);
    assert!(state.failures.is_empty());
}

#[tokio::test]
async fn test_same_exec_id_at_other_time_is_new_execution() {
    let h = TestHarness::new().await;
    let first = execution_msg(&h.order, "X-1", "partial_fill", dec!(4), dec!(100), at(0));
    let second = execution_msg(&h.order, "X-1", "partial_fill", dec!(2), dec!(100), at(5));

    h.orders.process(&first).await.unwrap();
    assert_eq!(h.orders.process(&second).await.unwrap(), Outcome::Applied);
    assert_eq!(h.order_now().await.filled_qty, dec!(6));
}

#[tokio::test]
async fn test_concurrent_executions_for_one_account_serialize() {
    let h = TestHarness::new().await;
    let a = execution_msg(&h.order, "X-1", "partial_fill", dec!(3), dec!(100), at(0));
    let b = execution_msg(&h.order, "X-2", "partial_fill", dec!(5), dec!(110), at(1));

    let (ra, rb) = tokio::join!(h.orders.process(&a), h.orders.process(&b));
    assert_eq!(ra.unwrap(), Outcome::Applied);
    assert_eq!(rb.unwrap(), Outcome::Applied);

    let state = h.store.snapshot().await;
    let order = &state.orders[&h.order.id];
    assert_eq!(order.filled_qty, dec!(8));
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_avg_price, Some(dec!(106.25)));
    assert_eq!(state.executions.len(), 2);
    assert_eq!(
        state.positions[&(h.account.id, "AAPL".to_string())].qty,
        dec!(8)
    );
}

#[tokio::test]
async fn test_self_test_message_touches_no_state() {
    let h = TestHarness::new().await;
    let msg = serde_json::to_vec(&json!({
        "order_id": SELF_TEST_ORDER_ID,
        "account": "probe",
        "side": "buy",
        "transaction_time": at(0).to_rfc3339(),
        "broker_exec_id": "probe-1",
        "type": "fill",
        "symbol": "TEST",
    }))
    .unwrap();

    let liveness = h.orders.liveness();
    assert_eq!(h.orders.process(&msg).await.unwrap(), Outcome::SelfTest);
    assert_eq!(h.orders.process(&msg).await.unwrap(), Outcome::SelfTest);

    assert_eq!(liveness.count(), 2);
    assert!(liveness.last_seen().is_some());
    assert_eq!(h.store.commit_count(), 0);
    assert_eq!(h.publisher.count(), 0);
}

// ============================================================================
// Order reconciliation: failure capture
// ============================================================================

#[tokio::test]
async fn test_malformed_message_recorded_as_marshal() {
    let h = TestHarness::new().await;

    let err = h.orders.process(b"{\"order_id\": 42").await.unwrap_err();
    assert!(matches!(err, ReconError::Marshal(_)));

    let state = h.store.snapshot().await;
    assert_eq!(state.failures.len(), 1);
    let failure = &state.failures[0];
    assert_eq!(failure.reason, FailureReason::Marshal);
    assert_eq!(failure.queue, "executions");
    assert_eq!(failure.payload, "{\"order_id\": 42");
    assert!(failure.account_id.is_none());
}

#[tokio::test]
async fn test_unknown_account_recorded_as_database() {
    let h = TestHarness::new().await;
    let mut raw: serde_json::Value = serde_json::from_slice(&execution_msg(
        &h.order,
        "X-1",
        "fill",
        dec!(1),
        dec!(1),
        at(0),
    ))
    .unwrap();
    raw["account"] = json!("BRK-UNKNOWN");

    let err = h
        .orders
        .process(&serde_json::to_vec(&raw).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::AccountNotFound(_)));

    let state = h.store.snapshot().await;
    assert_eq!(state.failures[0].reason, FailureReason::Database);
    assert!(state.executions.is_empty());
}

#[tokio::test]
async fn test_execution_insert_failure_recorded_and_rolled_back() {
    let h = TestHarness::new().await;
    h.store.set_fail_insert_execution(true);
    let msg = execution_msg(&h.order, "X-1", "fill", dec!(10), dec!(5), at(0));

    let err = h.orders.process(&msg).await.unwrap_err();
    assert!(matches!(err, ReconError::Database(_)));

    let state = h.store.snapshot().await;
    assert!(state.executions.is_empty());
    assert_eq!(state.orders[&h.order.id].status, OrderStatus::Accepted);
    assert_eq!(state.failures.len(), 1);
    assert_eq!(state.failures[0].reason, FailureReason::Database);
    assert_eq!(state.failures[0].account_id, Some(h.account.id));
    assert_eq!(h.publisher.count(), 0);
}

#[tokio::test]
async fn test_order_update_failure_recorded_as_downstream() {
    let h = TestHarness::new().await;
    let fill = execution_msg(&h.order, "X-1", "fill", dec!(10), dec!(5), at(0));
    h.orders.process(&fill).await.unwrap();

    // A filled order accepts nothing further
    let late = execution_msg(&h.order, "X-2", "cancel", dec!(0), dec!(0), at(10));
    let err = h.orders.process(&late).await.unwrap_err();
    assert!(matches!(err, ReconError::Downstream(_)));

    let state = h.store.snapshot().await;
    assert_eq!(state.executions.len(), 1);
    assert_eq!(state.failures.len(), 1);
    let failure = &state.failures[0];
    assert_eq!(failure.reason, FailureReason::Downstream);
    assert_eq!(failure.account_id, Some(h.account.id));
    assert_eq!(failure.order_id, Some(h.order.id));
}

#[tokio::test]
async fn test_position_failure_rolls_back_order_update() {
    let h = TestHarness::new().await;
    h.store.set_fail_apply_position(true);
    let msg = execution_msg(&h.order, "X-1", "fill", dec!(10), dec!(5), at(0));

    let err = h.orders.process(&msg).await.unwrap_err();
    assert!(matches!(err, ReconError::Downstream(_)));

    let state = h.store.snapshot().await;
    assert_eq!(state.orders[&h.order.id].status, OrderStatus::Accepted);
    assert!(state.executions.is_empty());
    assert_eq!(state.failures[0].reason, FailureReason::Downstream);
}

#[tokio::test]
async fn test_publish_failure_rolls_back_and_redelivery_applies() {
    let h = TestHarness::new().await;
    let msg = execution_msg(&h.order, "X-1", "partial_fill", dec!(2), dec!(50), at(0));

    h.publisher.set_fail(true);
    let err = h.orders.process(&msg).await.unwrap_err();
    assert!(matches!(err, ReconError::Publish(_)));

    let state = h.store.snapshot().await;
    assert!(state.executions.is_empty());
    assert_eq!(state.orders[&h.order.id].filled_qty, Decimal::ZERO);
    assert!(state.failures.is_empty());

    h.publisher.set_fail(false);
    assert_eq!(h.orders.process(&msg).await.unwrap(), Outcome::Applied);
    assert_eq!(h.order_now().await.filled_qty, dec!(2));
}

#[tokio::test]
async fn test_fill_email_failure_rolls_back() {
    let h = TestHarness::new().await;
    h.notifier.set_fail(true);
    let msg = execution_msg(&h.order, "X-1", "fill", dec!(10), dec!(5), at(0));

    let err = h.orders.process(&msg).await.unwrap_err();
    assert!(matches!(err, ReconError::Notify(_)));

    let state = h.store.snapshot().await;
    assert!(state.executions.is_empty());
    assert_eq!(state.orders[&h.order.id].status, OrderStatus::Accepted);
}

#[tokio::test]
async fn test_partial_fill_sends_no_email() {
    let h = TestHarness::new().await;
    let msg = execution_msg(&h.order, "X-1", "partial_fill", dec!(1), dec!(5), at(0));

    h.orders.process(&msg).await.unwrap();
    assert!(h.notifier.sent().is_empty());
    assert_eq!(h.publisher.events()[0].1.event, EventKind::PartialFill);
}

// ============================================================================
// Cancel rejections
// ============================================================================

#[tokio::test]
async fn test_cancel_reject_on_accepted_order_cancels_locally() {
    let h = TestHarness::new().await;

    let outcome = h
        .cancels
        .process(&cancel_reject_msg(&h.order, "cancel pending"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Applied);

    let order = h.order_now().await;
    assert_eq!(order.status, OrderStatus::Canceled);
    assert!(order.canceled_at.is_some());

    let events = h.publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.event, EventKind::Canceled);
}

#[tokio::test]
async fn test_cancel_reject_on_advanced_order_only_notifies() {
    let h = TestHarness::new().await;
    let fill = execution_msg(&h.order, "X-1", "partial_fill", dec!(4), dec!(10), at(0));
    h.orders.process(&fill).await.unwrap();

    h.cancels
        .process(&cancel_reject_msg(&h.order, "order already partially filled"))
        .await
        .unwrap();

    let order = h.order_now().await;
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_qty, dec!(4));

    let events = h.publisher.events();
    let last = &events.last().unwrap().1;
    assert_eq!(last.event, EventKind::OrderCancelRejected);
    assert_eq!(
        last.reason.as_deref(),
        Some("order already partially filled")
    );
}

#[tokio::test]
async fn test_cancel_reject_for_unknown_order_recorded() {
    let h = TestHarness::new().await;
    let ghost = Order::accepted(h.account.id, "AAPL", Side::Buy, dec!(1));

    let err = h
        .cancels
        .process(&cancel_reject_msg(&ghost, "n/a"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::OrderNotFound(_)));

    let state = h.store.snapshot().await;
    assert_eq!(state.failures.len(), 1);
    assert_eq!(state.failures[0].queue, "cancel_rejections");
    assert_eq!(state.failures[0].order_id, Some(ghost.id));
    assert_eq!(h.publisher.count(), 0);
}

#[tokio::test]
async fn test_cancel_reject_publish_failure_keeps_order() {
    let h = TestHarness::new().await;
    h.publisher.set_fail(true);

    let err = h
        .cancels
        .process(&cancel_reject_msg(&h.order, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::Publish(_)));
    assert_eq!(h.order_now().await.status, OrderStatus::Accepted);
}

// ============================================================================
// Consumer loop over the channel transport
// ============================================================================

#[tokio::test]
async fn test_consumer_acks_good_and_dead_letters_poison() {
    let h = TestHarness::new().await;
    let (queue, subscription) = ChannelQueue::new("executions", 2);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    queue.publish(b"poison".to_vec()).unwrap();
    queue
        .publish(execution_msg(
            &h.order,
            "X-1",
            "fill",
            dec!(10),
            dec!(5),
            at(0),
        ))
        .unwrap();

    let orders = h.orders.clone();
    let consumer = tokio::spawn(async move { orders.run(subscription, shutdown_rx).await });

    for _ in 0..200 {
        if queue.dead_letters().len() == 1 && h.store.snapshot().await.executions.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    consumer.await.unwrap();

    assert_eq!(queue.dead_letters(), vec![b"poison".to_vec()]);
    let state = h.store.snapshot().await;
    assert_eq!(state.executions.len(), 1);
    // Recorded once per delivery attempt
    assert_eq!(state.failures.len(), 2);
    assert!(
        state
            .failures
            .iter()
            .all(|f| f.reason == FailureReason::Marshal)
    );
}

#[tokio::test]
async fn test_overflowing_execution_recorded_and_next_message_applied() {
    let h = TestHarness::new().await;
    let (queue, subscription) = ChannelQueue::new("executions", 1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let huge = execution_msg(&h.order, "X-1", "partial_fill", dec!(2), Decimal::MAX, at(0));
    let err = h.orders.process(&huge).await.unwrap_err();
    assert!(matches!(err, ReconError::Downstream(_)));

    queue.publish(huge.clone()).unwrap();
    queue
        .publish(execution_msg(
            &h.order,
            "X-2",
            "partial_fill",
            dec!(2),
            dec!(50),
            at(1),
        ))
        .unwrap();

    let orders = h.orders.clone();
    let consumer = tokio::spawn(async move { orders.run(subscription, shutdown_rx).await });

    for _ in 0..200 {
        if queue.dead_letters().len() == 1 && h.store.snapshot().await.executions.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    consumer.await.unwrap();

    assert_eq!(queue.dead_letters(), vec![huge]);
    let state = h.store.snapshot().await;
    assert_eq!(state.executions.len(), 1);
    let order = &state.orders[&h.order.id];
    assert_eq!(order.filled_qty, dec!(2));
    assert_eq!(order.filled_avg_price, Some(dec!(50)));
    assert_eq!(state.failures.len(), 2);
    assert!(
        state
            .failures
            .iter()
            .all(|f| f.reason == FailureReason::Downstream && f.order_id == Some(h.order.id))
    );
}
