//! PostgreSQL Store
//!
//! `sqlx` implementation of [`Store`] / [`StoreTx`]. Row locks use
//! `SELECT ... FOR UPDATE`; the natural key on `executions` is backed by
//! the `uq_executions_broker_exec` unique constraint.

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{Isolation, Store, StoreError, StoreTx};
use crate::core_types::{AccountId, OrderId, RelationshipId, TransferId};
use crate::execution::types::{Execution, ExecutionType, IdempotencyKey};
use crate::failure::types::TradeFailure;
use crate::funding::state::{RelationshipStatus, TransferStatus};
use crate::funding::types::{AchRelationship, ApprovalMethod, Transfer, TransferDirection};
use crate::models::{Account, AccountStatus, Order, OrderStatus, Position, Side};

const ACCOUNT_COLUMNS: &str = "id, broker_account_id, status, email, given_name";

const ORDER_COLUMNS: &str = "id, account_id, symbol, side, qty, filled_qty, filled_avg_price, \
                             status, filled_at, canceled_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, order_id, account_id, symbol, side, qty, price, exec_type, \
                                 broker_exec_id, transaction_time";

const RELATIONSHIP_COLUMNS: &str = "id, account_id, status, approval_method, account_owner_name, \
                                    bank_account_type, bank_account_mask, bank_routing_number, \
                                    processor_token, aggregator_access_token, aggregator_account_id, \
                                    broker_relationship_id, failed_attempts, expires_at, \
                                    created_at, updated_at";

const TRANSFER_COLUMNS: &str = "id, account_id, relationship_id, direction, amount, status, \
                                broker_transfer_id, balance_validated, expires_at, \
                                created_at, updated_at";

/// PostgreSQL-backed store sharing one process-wide pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin_with(&self, isolation: Isolation) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if isolation == Isolation::RepeatableRead {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .execute(&mut *tx)
                .await?;
        }
        Ok(Box::new(PgTx { tx }))
    }

    async fn actionable_relationships(&self) -> Result<Vec<AchRelationship>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM ach_relationships \
             WHERE status IN ($1, $2) ORDER BY created_at ASC"
        ))
        .bind(RelationshipStatus::Queued.as_str())
        .bind(RelationshipStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(relationship_from_row).collect()
    }

    async fn actionable_transfers(&self) -> Result<Vec<Transfer>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(TransferStatus::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transfer_from_row).collect()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn find_execution(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE broker_exec_id = $1 AND transaction_time = $2"
        ))
        .bind(&key.broker_exec_id)
        .bind(key.transaction_time)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn insert_execution(&mut self, execution: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (id, order_id, account_id, symbol, side, qty, price, exec_type,
                 broker_exec_id, transaction_time, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            "#,
        )
        .bind(execution.id.inner())
        .bind(execution.order_id.inner())
        .bind(execution.account_id.inner())
        .bind(&execution.symbol)
        .bind(execution.side.as_str())
        .bind(execution.qty)
        .bind(execution.price)
        .bind(execution.exec_type.as_str())
        .bind(&execution.broker_exec_id)
        .bind(execution.transaction_time)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                Err(StoreError::Duplicate(execution.idempotency_key().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_account_by_broker_id(
        &mut self,
        broker_account_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE broker_account_id = $1 FOR UPDATE"
        ))
        .bind(broker_account_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.inner())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.inner())
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.inner())
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn save_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET filled_qty = $1, filled_avg_price = $2, status = $3,
                filled_at = $4, canceled_at = $5, updated_at = $6
            WHERE id = $7
            "#,
        )
        .bind(order.filled_qty)
        .bind(order.filled_avg_price)
        .bind(order.status.as_str())
        .bind(order.filled_at)
        .bind(order.canceled_at)
        .bind(order.updated_at)
        .bind(order.id.inner())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    async fn apply_position(&mut self, execution: &Execution) -> Result<Position, StoreError> {
        let row = sqlx::query(
            "SELECT qty, avg_entry_price FROM positions \
             WHERE account_id = $1 AND symbol = $2 FOR UPDATE",
        )
        .bind(execution.account_id.inner())
        .bind(&execution.symbol)
        .fetch_optional(&mut *self.tx)
        .await?;

        let mut position = Position::flat(execution.account_id, execution.symbol.clone());
        if let Some(row) = row {
            position.qty = row.try_get::<Decimal, _>("qty")?;
            position.avg_entry_price = row.try_get::<Decimal, _>("avg_entry_price")?;
        }
        position
            .apply_fill(execution.side, execution.qty, execution.price)
            .map_err(|e| StoreError::Arithmetic(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO positions (account_id, symbol, qty, avg_entry_price, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (account_id, symbol)
            DO UPDATE SET qty = EXCLUDED.qty,
                          avg_entry_price = EXCLUDED.avg_entry_price,
                          updated_at = NOW()
            "#,
        )
        .bind(position.account_id.inner())
        .bind(&position.symbol)
        .bind(position.qty)
        .bind(position.avg_entry_price)
        .execute(&mut *self.tx)
        .await?;

        Ok(position)
    }

    async fn insert_trade_failure(&mut self, failure: &TradeFailure) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trade_failures
                (id, queue, payload, reason, error, account_id, order_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(failure.id.inner())
        .bind(&failure.queue)
        .bind(&failure.payload)
        .bind(failure.reason.as_str())
        .bind(&failure.error)
        .bind(failure.account_id.map(|id| id.inner()))
        .bind(failure.order_id.map(|id| id.inner()))
        .bind(failure.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn lock_relationship(
        &mut self,
        id: RelationshipId,
    ) -> Result<Option<AchRelationship>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM ach_relationships WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.inner())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(relationship_from_row).transpose()
    }

    async fn save_relationship(
        &mut self,
        relationship: &AchRelationship,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ach_relationships
            SET status = $1, broker_relationship_id = $2, failed_attempts = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(relationship.status.as_str())
        .bind(&relationship.broker_relationship_id)
        .bind(relationship.failed_attempts)
        .bind(relationship.updated_at)
        .bind(relationship.id.inner())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("relationship {}", relationship.id)));
        }
        Ok(())
    }

    async fn lock_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.inner())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn save_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = $1, broker_transfer_id = $2, balance_validated = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(transfer.status.as_str())
        .bind(&transfer.broker_transfer_id)
        .bind(transfer.balance_validated)
        .bind(transfer.updated_at)
        .bind(transfer.id.inner())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("transfer {}", transfer.id)));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

// === Row mapping ===

/// Parse a TEXT column holding an enum name
fn parse_col<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(StoreError::CorruptRow)
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id")?),
        broker_account_id: row.try_get("broker_account_id")?,
        status: parse_col::<AccountStatus>(row, "status")?,
        email: row.try_get("email")?,
        given_name: row.try_get("given_name")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        symbol: row.try_get("symbol")?,
        side: parse_col::<Side>(row, "side")?,
        qty: row.try_get("qty")?,
        filled_qty: row.try_get("filled_qty")?,
        filled_avg_price: row.try_get("filled_avg_price")?,
        status: parse_col::<OrderStatus>(row, "status")?,
        filled_at: row.try_get("filled_at")?,
        canceled_at: row.try_get("canceled_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    Ok(Execution {
        id: crate::core_types::ExecutionId::from_uuid(row.try_get("id")?),
        order_id: OrderId::from_uuid(row.try_get("order_id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        symbol: row.try_get("symbol")?,
        side: parse_col::<Side>(row, "side")?,
        qty: row.try_get("qty")?,
        price: row.try_get("price")?,
        exec_type: parse_col::<ExecutionType>(row, "exec_type")?,
        broker_exec_id: row.try_get("broker_exec_id")?,
        transaction_time: row.try_get("transaction_time")?,
    })
}

fn relationship_from_row(row: &PgRow) -> Result<AchRelationship, StoreError> {
    Ok(AchRelationship {
        id: RelationshipId::from_uuid(row.try_get("id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        status: parse_col::<RelationshipStatus>(row, "status")?,
        approval_method: parse_col::<ApprovalMethod>(row, "approval_method")?,
        account_owner_name: row.try_get("account_owner_name")?,
        bank_account_type: row.try_get("bank_account_type")?,
        bank_account_mask: row.try_get("bank_account_mask")?,
        bank_routing_number: row.try_get("bank_routing_number")?,
        processor_token: row.try_get("processor_token")?,
        aggregator_access_token: row.try_get("aggregator_access_token")?,
        aggregator_account_id: row.try_get("aggregator_account_id")?,
        broker_relationship_id: row.try_get("broker_relationship_id")?,
        failed_attempts: row.try_get("failed_attempts")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: TransferId::from_uuid(row.try_get("id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        relationship_id: RelationshipId::from_uuid(row.try_get("relationship_id")?),
        direction: parse_col::<TransferDirection>(row, "direction")?,
        amount: row.try_get("amount")?,
        status: parse_col::<TransferStatus>(row, "status")?,
        broker_transfer_id: row.try_get("broker_transfer_id")?,
        balance_validated: row.try_get("balance_validated")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
