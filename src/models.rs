// models.rs - Order, account and position types touched by reconciliation

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{AccountId, OrderId};
use crate::execution::types::{Execution, ExecutionType};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("Invalid side: {}", s)),
        }
    }
}

/// Order status
///
/// Once an order reaches Filled, Canceled, Expired or Rejected it is
/// terminal from the customer's point of view. Canceled is the one
/// terminal state a later broker execution may still override, because
/// cancels are applied optimistically before the broker confirms them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(OrderStatus::Accepted),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" => Ok(OrderStatus::Canceled),
            "expired" => Ok(OrderStatus::Expired),
            "rejected" => Ok(OrderStatus::Rejected),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Order {0} is already filled")]
    AlreadyFilled(OrderId),

    #[error("Execution side {execution} does not match order side {order}")]
    SideMismatch { order: Side, execution: Side },

    #[error("Execution quantity must be positive")]
    InvalidQuantity,

    #[error("Order {id} is already {status}")]
    Closed { id: OrderId, status: OrderStatus },

    #[error("Arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

/// A customer order as seen by the reconciliation engines.
///
/// Also the `order` payload of every real-time stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a freshly accepted order (used by tests and fixtures;
    /// production orders are created by the placement path)
    pub fn accepted(
        account_id: AccountId,
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
    ) -> Self {
        Self {
            id: OrderId::new(),
            account_id,
            symbol: symbol.into(),
            side,
            qty,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            status: OrderStatus::Accepted,
            filled_at: None,
            canceled_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Remaining quantity to fill
    #[inline]
    pub fn remaining_qty(&self) -> Decimal {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }

    /// Apply a broker execution to this order.
    ///
    /// Fills accumulate `filled_qty` and keep `filled_avg_price` volume
    /// weighted. The broker is authoritative: a fill on a locally canceled
    /// order un-winds the cancel. Expired and rejected orders accept
    /// nothing further. The order is left untouched on error.
    pub fn apply(&mut self, exec: &Execution) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Filled => return Err(OrderError::AlreadyFilled(self.id)),
            OrderStatus::Expired | OrderStatus::Rejected => {
                return Err(OrderError::Closed {
                    id: self.id,
                    status: self.status,
                });
            }
            _ => {}
        }

        match exec.exec_type {
            ExecutionType::Fill | ExecutionType::PartialFill => {
                if exec.side != self.side {
                    return Err(OrderError::SideMismatch {
                        order: self.side,
                        execution: exec.side,
                    });
                }
                if exec.qty <= Decimal::ZERO {
                    return Err(OrderError::InvalidQuantity);
                }

                let (new_filled, avg_price) = self.filled_after(exec.qty, exec.price)?;
                self.filled_avg_price = Some(avg_price);
                self.filled_qty = new_filled;

                if exec.exec_type == ExecutionType::Fill || new_filled >= self.qty {
                    self.status = OrderStatus::Filled;
                    self.filled_at = Some(exec.transaction_time);
                } else {
                    self.status = OrderStatus::PartiallyFilled;
                }
                self.canceled_at = None;
            }
            ExecutionType::Canceled => {
                self.status = OrderStatus::Canceled;
                self.canceled_at = Some(exec.transaction_time);
            }
            ExecutionType::Expired => self.status = OrderStatus::Expired,
            ExecutionType::Rejected => self.status = OrderStatus::Rejected,
        }

        self.updated_at = exec.transaction_time;
        Ok(())
    }

    /// Filled quantity and volume-weighted average price after one more fill
    fn filled_after(
        &self,
        qty: Decimal,
        price: Decimal,
    ) -> Result<(Decimal, Decimal), OrderError> {
        let new_filled = self
            .filled_qty
            .checked_add(qty)
            .ok_or(OrderError::Overflow("filled quantity"))?;
        let prior_notional = self
            .filled_avg_price
            .unwrap_or(Decimal::ZERO)
            .checked_mul(self.filled_qty)
            .ok_or(OrderError::Overflow("filled notional"))?;
        let avg_price = price
            .checked_mul(qty)
            .and_then(|notional| notional.checked_add(prior_notional))
            .and_then(|notional| notional.checked_div(new_filled))
            .ok_or(OrderError::Overflow("average fill price"))?;
        Ok((new_filled, avg_price))
    }

    /// Mark canceled locally (cancel-rejection un-wind path)
    pub fn mark_canceled(&mut self, at: DateTime<Utc>) {
        self.status = OrderStatus::Canceled;
        self.canceled_at = Some(at);
        self.updated_at = at;
    }
}

/// Account status as maintained by onboarding / compliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Submitted,
    ActionRequired,
    Approved,
    Active,
    Rejected,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Submitted => "submitted",
            AccountStatus::ActionRequired => "action_required",
            AccountStatus::Approved => "approved",
            AccountStatus::Active => "active",
            AccountStatus::Rejected => "rejected",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(AccountStatus::Submitted),
            "action_required" => Ok(AccountStatus::ActionRequired),
            "approved" => Ok(AccountStatus::Approved),
            "active" => Ok(AccountStatus::Active),
            "rejected" => Ok(AccountStatus::Rejected),
            "disabled" => Ok(AccountStatus::Disabled),
            _ => Err(format!("Invalid account status: {}", s)),
        }
    }
}

/// Brokerage account (read-only from this subsystem's point of view)
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    /// Account identifier assigned by the clearing broker; unique
    pub broker_account_id: String,
    pub status: AccountStatus,
    pub email: Option<String>,
    pub given_name: Option<String>,
}

impl Account {
    /// Whether KYC / compliance has cleared the account for funding
    pub fn fundable(&self) -> bool {
        matches!(self.status, AccountStatus::Approved | AccountStatus::Active)
    }
}

/// Per-account, per-symbol holding
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: String,
    /// Signed quantity; negative is short
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
}

impl Position {
    pub fn flat(account_id: AccountId, symbol: impl Into<String>) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            qty: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
        }
    }

    /// Apply one fill.
    ///
    /// Adding to a position re-averages the entry price, reducing keeps it,
    /// and crossing through zero restarts it at the fill price. The
    /// position is left untouched on error.
    pub fn apply_fill(
        &mut self,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Result<(), OrderError> {
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let new_qty = self
            .qty
            .checked_add(signed)
            .ok_or(OrderError::Overflow("position quantity"))?;

        let avg_entry_price = if self.qty.is_zero()
            || self.qty.is_sign_positive() == signed.is_sign_positive()
        {
            self.avg_entry_price
                .checked_mul(self.qty.abs())
                .zip(price.checked_mul(qty))
                .and_then(|(held, added)| held.checked_add(added))
                .and_then(|notional| notional.checked_div(new_qty.abs()))
                .ok_or(OrderError::Overflow("average entry price"))?
        } else if new_qty.is_zero() {
            Decimal::ZERO
        } else if new_qty.is_sign_positive() != self.qty.is_sign_positive() {
            price
        } else {
            self.avg_entry_price
        };

        self.qty = new_qty;
        self.avg_entry_price = avg_entry_price;
        Ok(())
    }
}
