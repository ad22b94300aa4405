//! Transfer State Machine
//!
//! Advances one queued transfer per call, inside its own transaction:
//!
//! ```text
//! expired                              → CANCELED (no external call)
//! relationship canceled / rejected     → CANCELED
//! account not fundable, relationship
//!   not approved or not registered     → roll back, retry next sweep
//! incoming + aggregator + production   → balance check
//!     re-auth required                 → REJECTED, relationship CANCELED
//!     insufficient                     → REJECTED
//!     other aggregator error           → roll back, retry next sweep
//! submit to broker                     → broker status (PENDING, ...)
//! ```
//!
//! Transfers in `approval_pending` wait for out-of-band micro-deposit
//! approval and are never picked up by the sweep.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::RowOutcome;
use super::error::FundingError;
use super::state::{RelationshipStatus, TransferStatus};
use super::types::{AchRelationship, ApprovalMethod, Transfer, TransferDirection};
use crate::clients::{AggregatorError, BankAggregator, ClearingBroker, TransferRequest};
use crate::config::Mode;
use crate::core_types::TransferId;
use crate::models::Account;
use crate::notify::{Notification, Notifier};
use crate::store::{Store, StoreTx};

pub struct TransferHandler {
    store: Arc<dyn Store>,
    broker: Arc<dyn ClearingBroker>,
    aggregator: Arc<dyn BankAggregator>,
    notifier: Arc<dyn Notifier>,
    mode: Mode,
}

/// Verdict of the balance gate
enum BalanceCheck {
    NotRequired,
    Passed,
    /// Bank credentials expired; carries the aggregator's detail
    ReauthRequired(String),
    Insufficient(Decimal),
}

impl TransferHandler {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn ClearingBroker>,
        aggregator: Arc<dyn BankAggregator>,
        notifier: Arc<dyn Notifier>,
        mode: Mode,
    ) -> Self {
        Self {
            store,
            broker,
            aggregator,
            notifier,
            mode,
        }
    }

    pub async fn process(&self, id: TransferId) -> Result<RowOutcome, FundingError> {
        let mut tx = self.store.begin().await?;

        let Some(mut transfer) = tx.lock_transfer(id).await? else {
            debug!(transfer_id = %id, "Transfer vanished before processing");
            return Ok(RowOutcome::Skipped);
        };
        if transfer.status != TransferStatus::Queued {
            return Ok(RowOutcome::Skipped);
        }

        let now = Utc::now();
        if transfer.is_expired(now) {
            transfer.transition(TransferStatus::Canceled, now);
            tx.save_transfer(&transfer).await?;
            tx.commit().await?;
            info!(
                transfer_id = %id,
                account_id = %transfer.account_id,
                expires_at = %transfer.expires_at,
                "Transfer expired, canceled"
            );
            return Ok(RowOutcome::transitioned(
                TransferStatus::Queued.as_str(),
                TransferStatus::Canceled.as_str(),
            ));
        }

        let account = tx
            .get_account(transfer.account_id)
            .await?
            .ok_or(FundingError::AccountNotFound(transfer.account_id))?;
        if !account.fundable() {
            debug!(transfer_id = %id, account_id = %account.id, "Account not fundable yet");
            return Ok(RowOutcome::Deferred("account not fundable"));
        }

        let rel = tx
            .lock_relationship(transfer.relationship_id)
            .await?
            .ok_or(FundingError::RelationshipNotFound(transfer.relationship_id))?;

        if rel.status.is_dead() {
            transfer.transition(TransferStatus::Canceled, now);
            tx.save_transfer(&transfer).await?;
            tx.commit().await?;
            info!(
                transfer_id = %id,
                relationship_id = %rel.id,
                relationship_status = %rel.status,
                "Relationship no longer usable, transfer canceled"
            );
            self.notify_transfer(&account, &transfer).await;
            return Ok(RowOutcome::transitioned(
                TransferStatus::Queued.as_str(),
                TransferStatus::Canceled.as_str(),
            ));
        }
        if rel.status != RelationshipStatus::Approved {
            debug!(transfer_id = %id, relationship_id = %rel.id, "Relationship not approved yet");
            return Ok(RowOutcome::Deferred("relationship not approved"));
        }
        let Some(broker_relationship_id) = rel.broker_relationship_id.clone() else {
            debug!(transfer_id = %id, relationship_id = %rel.id, "Relationship not registered");
            return Ok(RowOutcome::Deferred("relationship not registered"));
        };

        match self.check_balance(&transfer, &rel).await? {
            BalanceCheck::NotRequired => {}
            BalanceCheck::Passed => transfer.balance_validated = true,
            BalanceCheck::ReauthRequired(detail) => {
                return self.reject_for_relink(tx, &account, transfer, rel, detail).await;
            }
            BalanceCheck::Insufficient(balance) => {
                return self.reject_for_balance(tx, &account, transfer, balance).await;
            }
        }

        let request = TransferRequest {
            broker_account_id: account.broker_account_id.clone(),
            relationship_id: broker_relationship_id,
            amount: transfer.amount,
            direction: transfer.direction,
        };
        let receipt = match self.broker.create_transfer(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    transfer_id = %id,
                    account_id = %account.id,
                    code = e.code(),
                    error = %e,
                    "Transfer submission failed, will retry next sweep"
                );
                return Err(e.into());
            }
        };

        let status = TransferStatus::from_broker(&receipt.status).unwrap_or_else(|| {
            warn!(
                transfer_id = %id,
                broker_status = %receipt.status,
                "Unknown broker transfer status, treating as pending"
            );
            TransferStatus::Pending
        });
        transfer.broker_transfer_id = Some(receipt.id);
        transfer.transition(status, Utc::now());
        tx.save_transfer(&transfer).await?;
        tx.commit().await?;

        info!(
            transfer_id = %id,
            account_id = %account.id,
            direction = %transfer.direction,
            amount = %transfer.amount,
            broker_transfer_id = ?transfer.broker_transfer_id,
            status = %transfer.status,
            balance_validated = transfer.balance_validated,
            "Transfer submitted to clearing broker"
        );
        self.notify_transfer(&account, &transfer).await;
        Ok(RowOutcome::transitioned(
            TransferStatus::Queued.as_str(),
            transfer.status.as_str(),
        ))
    }

    fn requires_balance_check(&self, transfer: &Transfer, rel: &AchRelationship) -> bool {
        transfer.direction == TransferDirection::Incoming
            && rel.approval_method == ApprovalMethod::Aggregator
            && self.mode.is_production()
    }

    /// Live balance gate for aggregator-linked deposits. Retryable
    /// aggregator errors come back as `Err`.
    async fn check_balance(
        &self,
        transfer: &Transfer,
        rel: &AchRelationship,
    ) -> Result<BalanceCheck, FundingError> {
        if !self.requires_balance_check(transfer, rel) {
            return Ok(BalanceCheck::NotRequired);
        }

        match self.aggregator.get_balance(rel).await {
            Ok(balance) if balance < transfer.amount => Ok(BalanceCheck::Insufficient(balance)),
            Ok(balance) => {
                debug!(
                    transfer_id = %transfer.id,
                    amount = %transfer.amount,
                    balance = %balance,
                    "Balance check passed"
                );
                Ok(BalanceCheck::Passed)
            }
            Err(AggregatorError::ReauthRequired(detail)) => {
                Ok(BalanceCheck::ReauthRequired(detail))
            }
            Err(AggregatorError::RateLimited) => {
                warn!(
                    transfer_id = %transfer.id,
                    relationship_id = %rel.id,
                    "Aggregator rate limited, will retry next sweep"
                );
                Err(AggregatorError::RateLimited.into())
            }
            Err(e) => {
                warn!(
                    transfer_id = %transfer.id,
                    relationship_id = %rel.id,
                    code = e.code(),
                    error = %e,
                    "Balance check failed, will retry next sweep"
                );
                Err(e.into())
            }
        }
    }

    async fn reject_for_relink(
        &self,
        mut tx: Box<dyn StoreTx>,
        account: &Account,
        mut transfer: Transfer,
        mut rel: AchRelationship,
        detail: String,
    ) -> Result<RowOutcome, FundingError> {
        let now = Utc::now();
        transfer.transition(TransferStatus::Rejected, now);
        rel.transition(RelationshipStatus::Canceled, now);
        tx.save_transfer(&transfer).await?;
        tx.save_relationship(&rel).await?;
        tx.commit().await?;

        warn!(
            transfer_id = %transfer.id,
            relationship_id = %rel.id,
            account_id = %account.id,
            detail = %detail,
            "Bank login required, transfer rejected and relationship canceled"
        );
        self.notify(
            account,
            Notification::RelinkBank {
                relationship_id: rel.id,
            },
        )
        .await;
        Ok(RowOutcome::transitioned(
            TransferStatus::Queued.as_str(),
            TransferStatus::Rejected.as_str(),
        ))
    }

    async fn reject_for_balance(
        &self,
        mut tx: Box<dyn StoreTx>,
        account: &Account,
        mut transfer: Transfer,
        balance: Decimal,
    ) -> Result<RowOutcome, FundingError> {
        transfer.transition(TransferStatus::Rejected, Utc::now());
        tx.save_transfer(&transfer).await?;
        tx.commit().await?;

        info!(
            transfer_id = %transfer.id,
            account_id = %account.id,
            amount = %transfer.amount,
            balance = %balance,
            "Insufficient bank balance, transfer rejected"
        );
        self.notify(
            account,
            Notification::CheckBalance {
                transfer_id: transfer.id,
                amount: transfer.amount,
            },
        )
        .await;
        Ok(RowOutcome::transitioned(
            TransferStatus::Queued.as_str(),
            TransferStatus::Rejected.as_str(),
        ))
    }

    async fn notify_transfer(&self, account: &Account, transfer: &Transfer) {
        self.notify(
            account,
            Notification::TransferUpdated {
                transfer_id: transfer.id,
                direction: transfer.direction,
                amount: transfer.amount,
                status: transfer.status,
            },
        )
        .await;
    }

    /// Best effort, after commit
    async fn notify(&self, account: &Account, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.notifier.notify(account, notification).await {
            warn!(account_id = %account.id, kind, error = %e, "Funding notification failed");
        }
    }
}
