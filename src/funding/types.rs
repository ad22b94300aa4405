//! Funding Core Types
//!
//! ACH relationship and transfer records advanced by the funding sweep.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::{RelationshipStatus, TransferStatus};
use crate::core_types::{AccountId, RelationshipId, TransferId};

/// How the bank link is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMethod {
    /// Verified through the bank-data aggregator (instant, balance-checkable)
    Aggregator,
    /// Verified by the user confirming two small deposits
    MicroDeposit,
}

impl ApprovalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMethod::Aggregator => "aggregator",
            ApprovalMethod::MicroDeposit => "micro_deposit",
        }
    }
}

impl FromStr for ApprovalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aggregator" => Ok(ApprovalMethod::Aggregator),
            "micro_deposit" => Ok(ApprovalMethod::MicroDeposit),
            _ => Err(format!("Invalid approval method: {}", s)),
        }
    }
}

/// Transfer direction from the brokerage account's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Deposit: bank → brokerage
    Incoming,
    /// Withdrawal: brokerage → bank
    Outgoing,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Incoming => "incoming",
            TransferDirection::Outgoing => "outgoing",
        }
    }

    /// Upper-case form the clearing broker expects
    pub fn broker_code(&self) -> &'static str {
        match self {
            TransferDirection::Incoming => "INCOMING",
            TransferDirection::Outgoing => "OUTGOING",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(TransferDirection::Incoming),
            "outgoing" => Ok(TransferDirection::Outgoing),
            _ => Err(format!("Invalid transfer direction: {}", s)),
        }
    }
}

/// Linked external bank account
#[derive(Debug, Clone, PartialEq)]
pub struct AchRelationship {
    pub id: RelationshipId,
    pub account_id: AccountId,
    pub status: RelationshipStatus,
    pub approval_method: ApprovalMethod,
    pub account_owner_name: String,
    /// `checking` / `savings`
    pub bank_account_type: String,
    /// Last four digits only
    pub bank_account_mask: String,
    pub bank_routing_number: String,
    /// Aggregator-issued processor token handed to the broker on registration
    pub processor_token: Option<String>,
    pub aggregator_access_token: Option<String>,
    pub aggregator_account_id: Option<String>,
    /// Assigned by the clearing broker once registered
    pub broker_relationship_id: Option<String>,
    pub failed_attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AchRelationship {
    /// New queued relationship expiring after `ttl`
    pub fn queued(
        account_id: AccountId,
        approval_method: ApprovalMethod,
        account_owner_name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RelationshipId::new(),
            account_id,
            status: RelationshipStatus::Queued,
            approval_method,
            account_owner_name: account_owner_name.into(),
            bank_account_type: "checking".to_string(),
            bank_account_mask: String::new(),
            bank_routing_number: String::new(),
            processor_token: None,
            aggregator_access_token: None,
            aggregator_account_id: None,
            broker_relationship_id: None,
            failed_attempts: 0,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.broker_relationship_id.is_some()
    }

    pub fn transition(&mut self, status: RelationshipStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Deposit or withdrawal instruction tied to one relationship
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: TransferId,
    pub account_id: AccountId,
    pub relationship_id: RelationshipId,
    pub direction: TransferDirection,
    pub amount: Decimal,
    pub status: TransferStatus,
    pub broker_transfer_id: Option<String>,
    pub balance_validated: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn queued(
        account_id: AccountId,
        relationship_id: RelationshipId,
        direction: TransferDirection,
        amount: Decimal,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            account_id,
            relationship_id,
            direction,
            amount,
            status: TransferStatus::Queued,
            broker_transfer_id: None,
            balance_validated: false,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.broker_transfer_id.is_some()
    }

    pub fn transition(&mut self, status: TransferStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}
