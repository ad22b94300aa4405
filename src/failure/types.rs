//! Trade failure record
//!
//! Append-only record of a queue message that could not be processed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::core_types::{AccountId, FailureId, OrderId};

/// Why a message could not be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Payload could not be deserialized
    Marshal,
    /// Lookup / insert against our own database failed
    Database,
    /// Order / ledger update or another collaborator failed
    Downstream,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Marshal => "marshal",
            FailureReason::Database => "database",
            FailureReason::Downstream => "downstream",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "marshal" => Ok(FailureReason::Marshal),
            "database" => Ok(FailureReason::Database),
            "downstream" => Ok(FailureReason::Downstream),
            _ => Err(format!("Invalid failure reason: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeFailure {
    pub id: FailureId,
    pub queue: String,
    /// Raw message body, lossily decoded as UTF-8
    pub payload: String,
    pub reason: FailureReason,
    pub error: String,
    pub account_id: Option<AccountId>,
    pub order_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
}

impl TradeFailure {
    pub fn new(
        queue: impl Into<String>,
        payload: &[u8],
        reason: FailureReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: FailureId::new(),
            queue: queue.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason,
            error: error.into(),
            account_id: None,
            order_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_account(mut self, account_id: Option<AccountId>) -> Self {
        self.account_id = account_id;
        self
    }

    pub fn with_order(mut self, order_id: Option<OrderId>) -> Self {
        self.order_id = order_id;
        self
    }
}
