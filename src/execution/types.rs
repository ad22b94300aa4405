//! Execution Types
//!
//! Wire messages consumed from the settlement queues and the immutable
//! `Execution` fact persisted for each applied confirmation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, ExecutionId, OrderId};
use crate::models::Side;

/// Order id carried by synthetic liveness probes published onto the
/// execution queue. Such messages never touch business state.
pub const SELF_TEST_ORDER_ID: &str = "00000000-0000-0000-0000-00000000beef";

/// Execution type reported by the clearing broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Fill,
    #[serde(alias = "partial")]
    PartialFill,
    #[serde(alias = "cancel")]
    Canceled,
    #[serde(alias = "expire")]
    Expired,
    #[serde(alias = "reject")]
    Rejected,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Fill => "fill",
            ExecutionType::PartialFill => "partial_fill",
            ExecutionType::Canceled => "canceled",
            ExecutionType::Expired => "expired",
            ExecutionType::Rejected => "rejected",
        }
    }

    /// Fills move positions and carry a price
    #[inline]
    pub fn is_fill(&self) -> bool {
        matches!(self, ExecutionType::Fill | ExecutionType::PartialFill)
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fill" => Ok(ExecutionType::Fill),
            "partial_fill" | "partial" => Ok(ExecutionType::PartialFill),
            "canceled" | "cancel" => Ok(ExecutionType::Canceled),
            "expired" | "expire" => Ok(ExecutionType::Expired),
            "rejected" | "reject" => Ok(ExecutionType::Rejected),
            _ => Err(format!("Invalid execution type: {}", s)),
        }
    }
}

/// Settlement confirmation as published by the clearing broker bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub order_id: String,
    /// Clearing-broker account identifier
    pub account: String,
    pub side: Side,
    #[serde(default)]
    pub qty: Decimal,
    #[serde(default)]
    pub price: Decimal,
    pub transaction_time: DateTime<Utc>,
    pub broker_exec_id: String,
    #[serde(rename = "type")]
    pub exec_type: ExecutionType,
    pub symbol: String,
}

impl ExecutionMessage {
    #[inline]
    pub fn is_self_test(&self) -> bool {
        self.order_id == SELF_TEST_ORDER_ID
    }

    /// Natural key of this confirmation
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.broker_exec_id.clone(), self.transaction_time)
    }
}

/// Cancel-rejection notice: the broker could not honour a cancel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRejectMessage {
    pub order_id: OrderId,
    #[serde(default)]
    pub reason: String,
}

/// (broker execution id, transaction time) - unique per settlement fact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub broker_exec_id: String,
    pub transaction_time: DateTime<Utc>,
}

impl IdempotencyKey {
    /// Timestamps are truncated to microseconds, the resolution
    /// PostgreSQL `TIMESTAMPTZ` keeps.
    pub fn new(broker_exec_id: String, transaction_time: DateTime<Utc>) -> Self {
        Self {
            broker_exec_id,
            transaction_time: transaction_time.trunc_subsecs(6),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.broker_exec_id,
            self.transaction_time.to_rfc3339()
        )
    }
}

/// Immutable settlement fact. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub exec_type: ExecutionType,
    pub broker_exec_id: String,
    pub transaction_time: DateTime<Utc>,
}

impl Execution {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: OrderId,
        account_id: AccountId,
        symbol: String,
        side: Side,
        qty: Decimal,
        price: Decimal,
        exec_type: ExecutionType,
        broker_exec_id: String,
        transaction_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            order_id,
            account_id,
            symbol,
            side,
            qty,
            price,
            exec_type,
            broker_exec_id,
            transaction_time: transaction_time.trunc_subsecs(6),
        }
    }

    /// Build the execution row for a message once the owning account is known
    pub fn from_message(msg: &ExecutionMessage, order_id: OrderId, account_id: AccountId) -> Self {
        Self::new(
            order_id,
            account_id,
            msg.symbol.clone(),
            msg.side,
            msg.qty,
            msg.price,
            msg.exec_type,
            msg.broker_exec_id.clone(),
            msg.transaction_time,
        )
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.broker_exec_id.clone(), self.transaction_time)
    }
}
