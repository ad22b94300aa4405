//! Funding FSM State Definitions
//!
//! State names match the `status` column values in PostgreSQL.
//!
//! ```text
//! Relationship:  QUEUED → PENDING → APPROVED
//!                  ↓         ↓  ↘
//!               CANCELED  CANCELED REJECTED
//!
//! Transfer:      QUEUED → APPROVAL_PENDING | PENDING → APPROVED
//!                  ↓                          ↓
//!           CANCELED | REJECTED           REJECTED | CANCELED
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// ACH relationship (bank link) states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    /// Created by funding intake, not yet registered with the broker
    Queued,
    /// Registered, awaiting broker / micro-deposit approval
    Pending,
    /// Terminal: usable for transfers
    Approved,
    /// Terminal: expired or canceled by the user
    Canceled,
    /// Terminal: refused by the broker or failed verification
    Rejected,
}

impl RelationshipStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelationshipStatus::Approved
                | RelationshipStatus::Canceled
                | RelationshipStatus::Rejected
        )
    }

    /// Approved is terminal but alive; canceled / rejected links can never fund
    #[inline]
    pub fn is_dead(&self) -> bool {
        matches!(self, RelationshipStatus::Canceled | RelationshipStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Queued => "queued",
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Approved => "approved",
            RelationshipStatus::Canceled => "canceled",
            RelationshipStatus::Rejected => "rejected",
        }
    }

    /// Map a clearing-broker status string (`QUEUED`, `APPROVED`, ...)
    pub fn from_broker(status: &str) -> Option<Self> {
        match status.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(RelationshipStatus::Queued),
            "SUBMITTED" | "PENDING" => Some(RelationshipStatus::Pending),
            "APPROVED" => Some(RelationshipStatus::Approved),
            "CANCELED" | "CANCELLED" => Some(RelationshipStatus::Canceled),
            "REJECTED" => Some(RelationshipStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for RelationshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RelationshipStatus::Queued),
            "pending" => Ok(RelationshipStatus::Pending),
            "approved" => Ok(RelationshipStatus::Approved),
            "canceled" => Ok(RelationshipStatus::Canceled),
            "rejected" => Ok(RelationshipStatus::Rejected),
            _ => Err(format!("Invalid relationship status: {}", s)),
        }
    }
}

/// Deposit / withdrawal states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Created, not yet submitted to the broker
    Queued,
    /// Waiting on an out-of-band micro-deposit approval; the sweep skips it
    ApprovalPending,
    /// Submitted to the broker
    Pending,
    /// Terminal: settled
    Approved,
    /// Terminal: refused (broker, insufficient balance, re-auth required)
    Rejected,
    /// Terminal: expired or canceled
    Canceled,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Approved | TransferStatus::Rejected | TransferStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::ApprovalPending => "approval_pending",
            TransferStatus::Pending => "pending",
            TransferStatus::Approved => "approved",
            TransferStatus::Rejected => "rejected",
            TransferStatus::Canceled => "canceled",
        }
    }

    /// Map a clearing-broker transfer status string
    pub fn from_broker(status: &str) -> Option<Self> {
        match status.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(TransferStatus::Queued),
            "APPROVAL_PENDING" => Some(TransferStatus::ApprovalPending),
            "PENDING" | "SENT_TO_CLEARING" | "SUBMITTED" => Some(TransferStatus::Pending),
            "APPROVED" | "COMPLETE" | "SETTLED" => Some(TransferStatus::Approved),
            "REJECTED" | "RETURNED" => Some(TransferStatus::Rejected),
            "CANCELED" | "CANCELLED" => Some(TransferStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TransferStatus::Queued),
            "approval_pending" => Ok(TransferStatus::ApprovalPending),
            "pending" => Ok(TransferStatus::Pending),
            "approved" => Ok(TransferStatus::Approved),
            "rejected" => Ok(TransferStatus::Rejected),
            "canceled" => Ok(TransferStatus::Canceled),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}
