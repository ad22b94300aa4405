//! In-memory Store for testing
//!
//! A transaction takes the single state mutex for its whole lifetime and
//! works on a staged copy, so concurrent transactions serialize (the
//! strongest form of the per-account row lock) and rollback is just
//! dropping the copy. Faults can be injected per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{Isolation, Store, StoreError, StoreTx};
use crate::core_types::{AccountId, OrderId, RelationshipId, TransferId};
use crate::execution::types::{Execution, IdempotencyKey};
use crate::failure::types::TradeFailure;
use crate::funding::state::{RelationshipStatus, TransferStatus};
use crate::funding::types::{AchRelationship, Transfer};
use crate::models::{Account, Order, Position};

#[derive(Debug, Default, Clone)]
pub struct MemoryState {
    pub accounts: HashMap<AccountId, Account>,
    pub orders: HashMap<OrderId, Order>,
    pub executions: Vec<Execution>,
    pub positions: HashMap<(AccountId, String), Position>,
    pub relationships: HashMap<RelationshipId, AchRelationship>,
    pub transfers: HashMap<TransferId, Transfer>,
    pub failures: Vec<TradeFailure>,
}

/// Injected failures
#[derive(Debug, Default)]
struct Faults {
    fail_insert_execution: bool,
    fail_apply_position: bool,
    fail_failure_insert: bool,
    /// Remaining serialization conflicts to raise on failure inserts
    serialization_conflicts: usize,
}

pub struct MemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    failure_insert_attempts: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(MemoryState::default())),
            faults: Arc::new(Mutex::new(Faults::default())),
            failure_insert_attempts: Arc::new(AtomicUsize::new(0)),
            commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mutate the committed state directly (fixtures)
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn insert_account(&self, account: Account) {
        self.with_state(|s| s.accounts.insert(account.id, account)).await;
    }

    pub async fn insert_order(&self, order: Order) {
        self.with_state(|s| s.orders.insert(order.id, order)).await;
    }

    pub async fn insert_relationship(&self, relationship: AchRelationship) {
        self.with_state(|s| s.relationships.insert(relationship.id, relationship))
            .await;
    }

    pub async fn insert_transfer(&self, transfer: Transfer) {
        self.with_state(|s| s.transfers.insert(transfer.id, transfer))
            .await;
    }

    pub fn set_fail_insert_execution(&self, fail: bool) {
        self.faults.lock().unwrap().fail_insert_execution = fail;
    }

    pub fn set_fail_apply_position(&self, fail: bool) {
        self.faults.lock().unwrap().fail_apply_position = fail;
    }

    pub fn set_fail_failure_insert(&self, fail: bool) {
        self.faults.lock().unwrap().fail_failure_insert = fail;
    }

    pub fn set_serialization_conflicts(&self, count: usize) {
        self.faults.lock().unwrap().serialization_conflicts = count;
    }

    pub fn failure_insert_attempts(&self) -> usize {
        self.failure_insert_attempts.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_with(&self, _isolation: Isolation) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            faults: self.faults.clone(),
            failure_insert_attempts: self.failure_insert_attempts.clone(),
            commits: self.commits.clone(),
        }))
    }

    async fn actionable_relationships(&self) -> Result<Vec<AchRelationship>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<AchRelationship> = state
            .relationships
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    RelationshipStatus::Queued | RelationshipStatus::Pending
                )
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn actionable_transfers(&self) -> Result<Vec<Transfer>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Queued)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    faults: Arc<Mutex<Faults>>,
    failure_insert_attempts: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_execution(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .staged
            .executions
            .iter()
            .find(|e| e.idempotency_key() == *key)
            .cloned())
    }

    async fn insert_execution(&mut self, execution: &Execution) -> Result<(), StoreError> {
        if self.faults.lock().unwrap().fail_insert_execution {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let key = execution.idempotency_key();
        if self
            .staged
            .executions
            .iter()
            .any(|e| e.idempotency_key() == key)
        {
            return Err(StoreError::Duplicate(key.to_string()));
        }
        self.staged.executions.push(execution.clone());
        Ok(())
    }

    async fn lock_account_by_broker_id(
        &mut self,
        broker_account_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .staged
            .accounts
            .values()
            .find(|a| a.broker_account_id == broker_account_id)
            .cloned())
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.staged.orders.get(&id).cloned())
    }

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError> {
        match self.staged.orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("order {}", order.id))),
        }
    }

    async fn apply_position(&mut self, execution: &Execution) -> Result<Position, StoreError> {
        if self.faults.lock().unwrap().fail_apply_position {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let position = self
            .staged
            .positions
            .entry((execution.account_id, execution.symbol.clone()))
            .or_insert_with(|| Position::flat(execution.account_id, execution.symbol.clone()));
        position
            .apply_fill(execution.side, execution.qty, execution.price)
            .map_err(|e| StoreError::Arithmetic(e.to_string()))?;
        Ok(position.clone())
    }

    async fn insert_trade_failure(&mut self, failure: &TradeFailure) -> Result<(), StoreError> {
        self.failure_insert_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.serialization_conflicts > 0 {
                faults.serialization_conflicts -= 1;
                return Err(StoreError::SerializationConflict);
            }
            if faults.fail_failure_insert {
                return Err(StoreError::CorruptRow("trade_failures".to_string()));
            }
        }
        self.staged.failures.push(failure.clone());
        Ok(())
    }

    async fn lock_relationship(
        &mut self,
        id: RelationshipId,
    ) -> Result<Option<AchRelationship>, StoreError> {
        Ok(self.staged.relationships.get(&id).cloned())
    }

    async fn save_relationship(
        &mut self,
        relationship: &AchRelationship,
    ) -> Result<(), StoreError> {
        match self.staged.relationships.get_mut(&relationship.id) {
            Some(existing) => {
                *existing = relationship.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "relationship {}",
                relationship.id
            ))),
        }
    }

    async fn lock_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        Ok(self.staged.transfers.get(&id).cloned())
    }

    async fn save_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError> {
        match self.staged.transfers.get_mut(&transfer.id) {
            Some(existing) => {
                *existing = transfer.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("transfer {}", transfer.id))),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard,
            staged,
            commits,
            ..
        } = *self;
        *guard = staged;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, Side};
    use rust_decimal_macros::dec;

    fn account() -> Account {
        Account {
            id: AccountId::new(),
            broker_account_id: "BRK-1".to_string(),
            status: AccountStatus::Active,
            email: None,
            given_name: None,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_writes() {
        let store = MemoryStore::new();
        let acct = account();
        let order = Order::accepted(acct.id, "AAPL", Side::Buy, dec!(1));
        store.insert_account(acct).await;
        store.insert_order(order.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let mut o = tx.get_order(order.id).await.unwrap().unwrap();
        o.mark_canceled(chrono::Utc::now());
        tx.save_order(&o).await.unwrap();
        tx.commit().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(
            state.orders[&order.id].status,
            crate::models::OrderStatus::Canceled
        );
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_discards_staged_writes() {
        let store = MemoryStore::new();
        let acct = account();
        let order = Order::accepted(acct.id, "AAPL", Side::Buy, dec!(1));
        store.insert_order(order.clone()).await;

        {
            let mut tx = store.begin().await.unwrap();
            let mut o = tx.get_order(order.id).await.unwrap().unwrap();
            o.mark_canceled(chrono::Utc::now());
            tx.save_order(&o).await.unwrap();
        }

        let state = store.snapshot().await;
        assert_eq!(
            state.orders[&order.id].status,
            crate::models::OrderStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_serialization_conflicts_count_down() {
        let store = MemoryStore::new();
        store.set_serialization_conflicts(1);
        let failure = TradeFailure::new(
            "q",
            b"{}",
            crate::failure::types::FailureReason::Marshal,
            "x",
        );

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_trade_failure(&failure).await.unwrap_err();
        assert!(err.is_serialization_conflict());
        tx.insert_trade_failure(&failure).await.unwrap();
        assert_eq!(store.failure_insert_attempts(), 2);
    }
}
