//! Persistence Seam
//!
//! Every logical operation of the workers runs inside one transaction
//! obtained from a [`Store`]. The PostgreSQL implementation maps each
//! [`StoreTx`] onto a `sqlx::Transaction`; the in-memory implementation
//! backs the unit and integration tests.
//!
//! # Transaction discipline
//!
//! 1. **One transaction per unit of work**: a queue message or one sweep row.
//! 2. **Row locks**: `lock_*` methods take an exclusive row lock
//!    (`SELECT ... FOR UPDATE`) held until commit / rollback.
//! 3. **Drop = rollback**: a transaction dropped without `commit` is rolled
//!    back, so early returns and panics never leak partial writes.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core_types::{AccountId, OrderId, RelationshipId, TransferId};
use crate::execution::types::{Execution, IdempotencyKey};
use crate::failure::types::TradeFailure;
use crate::funding::types::{AchRelationship, Transfer};
use crate::models::{Account, Order, Position};

pub use postgres::PgStore;

#[cfg(test)]
pub use memory::MemoryStore;

/// PostgreSQL SQLSTATE for `serialization_failure`
pub const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization conflict, transaction must be retried")]
    SerializationConflict,

    #[error("Unique constraint violated: {0}")]
    Duplicate(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),
}

impl StoreError {
    /// Whether retrying the same transaction can succeed
    pub fn is_serialization_conflict(&self) -> bool {
        match self {
            StoreError::SerializationConflict => true,
            StoreError::Database(e) => e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code.as_ref() == SERIALIZATION_FAILURE),
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::SerializationConflict => "SERIALIZATION_CONFLICT",
            StoreError::Duplicate(_) => "DUPLICATE",
            StoreError::CorruptRow(_) => "CORRUPT_ROW",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Arithmetic(_) => "ARITHMETIC",
        }
    }
}

/// Transaction isolation requested from [`Store::begin_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
}

/// Entry point for all persistence
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a `READ COMMITTED` transaction
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.begin_with(Isolation::ReadCommitted).await
    }

    async fn begin_with(&self, isolation: Isolation) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Relationships the sweep must look at (`queued`, `pending`)
    async fn actionable_relationships(&self) -> Result<Vec<AchRelationship>, StoreError>;

    /// Transfers the sweep must look at (`queued`)
    async fn actionable_transfers(&self) -> Result<Vec<Transfer>, StoreError>;
}

/// One open transaction
#[async_trait]
pub trait StoreTx: Send {
    // === Executions ===

    async fn find_execution(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Execution>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] if the natural key exists
    async fn insert_execution(&mut self, execution: &Execution) -> Result<(), StoreError>;

    // === Accounts ===

    /// Read an account by clearing-broker id with an exclusive row lock
    async fn lock_account_by_broker_id(
        &mut self,
        broker_account_id: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Read an account by internal id with an exclusive row lock
    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    // === Orders & positions ===

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Apply a fill to the owning account's position, returning the result
    async fn apply_position(&mut self, execution: &Execution) -> Result<Position, StoreError>;

    // === Failures ===

    async fn insert_trade_failure(&mut self, failure: &TradeFailure) -> Result<(), StoreError>;

    // === Funding ===

    async fn lock_relationship(
        &mut self,
        id: RelationshipId,
    ) -> Result<Option<AchRelationship>, StoreError>;

    async fn save_relationship(&mut self, relationship: &AchRelationship)
    -> Result<(), StoreError>;

    async fn lock_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn save_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError>;

    // === Completion ===

    /// Dropping the transaction instead rolls it back
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
