//! External Collaborator Clients
//!
//! [`ClearingBroker`] registers bank relationships and submits transfers;
//! [`BankAggregator`] reports live bank balances. Both are stateless and
//! shared across workers behind `Arc<dyn ...>`.

pub mod aggregator;
pub mod broker;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::funding::types::{AchRelationship, TransferDirection};

pub use aggregator::HttpAggregator;
pub use broker::HttpClearingBroker;

/// Bank-link registration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipRequest {
    /// Clearing-broker account the relationship belongs to
    #[serde(skip)]
    pub broker_account_id: String,
    pub account_owner_name: String,
    pub bank_account_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_routing_number: Option<String>,
}

impl RelationshipRequest {
    /// Aggregator links register through the processor token, micro-deposit
    /// links through routing details
    pub fn for_relationship(broker_account_id: &str, rel: &AchRelationship) -> Self {
        let routing = match rel.processor_token {
            Some(_) => None,
            None => Some(rel.bank_routing_number.clone()),
        };
        Self {
            broker_account_id: broker_account_id.to_string(),
            account_owner_name: rel.account_owner_name.clone(),
            bank_account_type: rel.bank_account_type.to_uppercase(),
            processor_token: rel.processor_token.clone(),
            bank_routing_number: routing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationshipReceipt {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub broker_account_id: String,
    /// Broker-assigned relationship id
    pub relationship_id: String,
    pub amount: Decimal,
    pub direction: TransferDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferReceipt {
    pub id: String,
    pub status: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Broker rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Transport(_) => "BROKER_TRANSPORT",
            BrokerError::Rejected { .. } => "BROKER_REJECTED",
            BrokerError::Decode(_) => "BROKER_DECODE",
        }
    }
}

#[async_trait]
pub trait ClearingBroker: Send + Sync {
    async fn create_relationship(
        &self,
        request: &RelationshipRequest,
    ) -> Result<RelationshipReceipt, BrokerError>;

    async fn create_transfer(&self, request: &TransferRequest)
    -> Result<TransferReceipt, BrokerError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregatorError {
    /// Bank credentials expired; only the user can fix this
    #[error("Bank login required: {0}")]
    ReauthRequired(String),

    #[error("Aggregator rate limit exceeded")]
    RateLimited,

    #[error("Aggregator unavailable: {0}")]
    Unavailable(String),
}

impl AggregatorError {
    pub fn code(&self) -> &'static str {
        match self {
            AggregatorError::ReauthRequired(_) => "AGGREGATOR_REAUTH",
            AggregatorError::RateLimited => "AGGREGATOR_RATE_LIMITED",
            AggregatorError::Unavailable(_) => "AGGREGATOR_UNAVAILABLE",
        }
    }
}

#[async_trait]
pub trait BankAggregator: Send + Sync {
    /// Current spendable balance of the linked bank account
    async fn get_balance(&self, relationship: &AchRelationship)
    -> Result<Decimal, AggregatorError>;
}
