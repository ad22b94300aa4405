//! Outbound Notifications
//!
//! Two seams:
//! - [`EventPublisher`]: real-time order events on a per-account topic.
//!   Part of the reconciliation transaction; a failed publish rolls back.
//! - [`Notifier`]: user emails. Dispatch is fire-and-forget from the
//!   caller's point of view, but dispatch itself can fail.

pub mod broadcast;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::core_types::{AccountId, OrderId, RelationshipId, TransferId};
use crate::execution::types::{Execution, ExecutionType};
use crate::funding::state::{RelationshipStatus, TransferStatus};
use crate::funding::types::TransferDirection;
use crate::models::{Account, Order};

pub use broadcast::BroadcastHub;
pub use http::HttpPublisher;

/// Per-account real-time topic name
pub fn account_topic(account_id: AccountId) -> String {
    format!("trade_updates#{}", account_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Fill,
    PartialFill,
    Canceled,
    Expired,
    Rejected,
    OrderCancelRejected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fill => "fill",
            EventKind::PartialFill => "partial_fill",
            EventKind::Canceled => "canceled",
            EventKind::Expired => "expired",
            EventKind::Rejected => "rejected",
            EventKind::OrderCancelRejected => "order_cancel_rejected",
        }
    }
}

impl From<ExecutionType> for EventKind {
    fn from(t: ExecutionType) -> Self {
        match t {
            ExecutionType::Fill => EventKind::Fill,
            ExecutionType::PartialFill => EventKind::PartialFill,
            ExecutionType::Canceled => EventKind::Canceled,
            ExecutionType::Expired => EventKind::Expired,
            ExecutionType::Rejected => EventKind::Rejected,
        }
    }
}

/// Real-time stream payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub event: EventKind,
    pub order: Order,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StreamEvent {
    /// Event for an applied execution; fills carry their price
    pub fn execution(execution: &Execution, order: &Order) -> Self {
        Self {
            event: execution.exec_type.into(),
            order: order.clone(),
            timestamp: execution.transaction_time,
            price: execution.exec_type.is_fill().then_some(execution.price),
            reason: None,
        }
    }

    pub fn canceled(order: &Order, at: DateTime<Utc>) -> Self {
        Self {
            event: EventKind::Canceled,
            order: order.clone(),
            timestamp: at,
            price: None,
            reason: None,
        }
    }

    pub fn cancel_rejected(order: &Order, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            event: EventKind::OrderCancelRejected,
            order: order.clone(),
            timestamp: at,
            price: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Failed to encode event: {0}")]
    Encode(String),

    #[error("Publish transport error: {0}")]
    Transport(String),

    #[error("Publish rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl PublishError {
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Encode(_) => "PUBLISH_ENCODE",
            PublishError::Transport(_) => "PUBLISH_TRANSPORT",
            PublishError::Rejected { .. } => "PUBLISH_REJECTED",
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, account_id: AccountId, event: &StreamEvent)
    -> Result<(), PublishError>;
}

/// User-facing email notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    OrderFilled {
        order_id: OrderId,
        symbol: String,
        qty: Decimal,
        price: Decimal,
    },
    RelationshipUpdated {
        relationship_id: RelationshipId,
        status: RelationshipStatus,
    },
    TransferUpdated {
        transfer_id: TransferId,
        direction: TransferDirection,
        amount: Decimal,
        status: TransferStatus,
    },
    /// Aggregator credentials expired; the user must relink the bank
    RelinkBank { relationship_id: RelationshipId },
    /// Deposit rejected for insufficient bank balance
    CheckBalance {
        transfer_id: TransferId,
        amount: Decimal,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OrderFilled { .. } => "order_filled",
            Notification::RelationshipUpdated { .. } => "relationship_updated",
            Notification::TransferUpdated { .. } => "transfer_updated",
            Notification::RelinkBank { .. } => "relink_bank",
            Notification::CheckBalance { .. } => "check_balance",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),
}

impl NotifyError {
    pub fn code(&self) -> &'static str {
        match self {
            NotifyError::Dispatch(_) => "NOTIFY_DISPATCH",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hand `notification` off for delivery to the account holder
    async fn notify(&self, account: &Account, notification: Notification)
    -> Result<(), NotifyError>;
}

/// Notifier that only logs; delivery is owned by the mail service
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        account: &Account,
        notification: Notification,
    ) -> Result<(), NotifyError> {
        info!(
            account_id = %account.id,
            email = ?account.email,
            kind = notification.kind(),
            notification = ?notification,
            "Notification dispatched"
        );
        Ok(())
    }
}
