//! Funding Relationship State Machine
//!
//! Advances one ACH relationship per call, inside its own transaction:
//!
//! ```text
//! expired                         → CANCELED (no external call)
//! PENDING, micro-deposit attempts
//!   exhausted                     → REJECTED
//! QUEUED, account fundable        → register with broker → broker status
//! ```
//!
//! Anything that cannot proceed rolls back and is retried next sweep.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::RowOutcome;
use super::error::FundingError;
use super::state::RelationshipStatus;
use super::types::{AchRelationship, ApprovalMethod};
use crate::clients::{ClearingBroker, RelationshipRequest};
use crate::core_types::RelationshipId;
use crate::models::Account;
use crate::notify::{Notification, Notifier};
use crate::store::{Store, StoreTx};

pub struct RelationshipHandler {
    store: Arc<dyn Store>,
    broker: Arc<dyn ClearingBroker>,
    notifier: Arc<dyn Notifier>,
    micro_deposit_max_attempts: i32,
}

impl RelationshipHandler {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn ClearingBroker>,
        notifier: Arc<dyn Notifier>,
        micro_deposit_max_attempts: i32,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            micro_deposit_max_attempts,
        }
    }

    pub async fn process(&self, id: RelationshipId) -> Result<RowOutcome, FundingError> {
        let mut tx = self.store.begin().await?;

        let Some(mut rel) = tx.lock_relationship(id).await? else {
            debug!(relationship_id = %id, "Relationship vanished before processing");
            return Ok(RowOutcome::Skipped);
        };
        let from = rel.status;
        if !matches!(from, RelationshipStatus::Queued | RelationshipStatus::Pending) {
            return Ok(RowOutcome::Skipped);
        }

        let now = Utc::now();
        if rel.is_expired(now) {
            rel.transition(RelationshipStatus::Canceled, now);
            tx.save_relationship(&rel).await?;
            tx.commit().await?;
            info!(
                relationship_id = %id,
                account_id = %rel.account_id,
                expires_at = %rel.expires_at,
                "Relationship expired, canceled"
            );
            return Ok(RowOutcome::transitioned(from.as_str(), rel.status.as_str()));
        }

        match from {
            RelationshipStatus::Pending => self.check_verification(tx, rel).await,
            _ if rel.is_registered() => {
                debug!(relationship_id = %id, "Registered, awaiting broker approval");
                Ok(RowOutcome::Skipped)
            }
            _ => self.register(tx, rel).await,
        }
    }

    /// Reject a micro-deposit link once the user has used up their attempts
    async fn check_verification(
        &self,
        mut tx: Box<dyn StoreTx>,
        mut rel: AchRelationship,
    ) -> Result<RowOutcome, FundingError> {
        if rel.approval_method != ApprovalMethod::MicroDeposit
            || rel.failed_attempts < self.micro_deposit_max_attempts
        {
            return Ok(RowOutcome::Skipped);
        }

        let from = rel.status;
        rel.transition(RelationshipStatus::Rejected, Utc::now());
        tx.save_relationship(&rel).await?;
        let account = tx.get_account(rel.account_id).await?;
        tx.commit().await?;

        warn!(
            relationship_id = %rel.id,
            account_id = %rel.account_id,
            failed_attempts = rel.failed_attempts,
            "Micro-deposit verification exhausted, relationship rejected"
        );
        if let Some(account) = account {
            self.notify(&account, &rel).await;
        }
        Ok(RowOutcome::transitioned(from.as_str(), rel.status.as_str()))
    }

    async fn register(
        &self,
        mut tx: Box<dyn StoreTx>,
        mut rel: AchRelationship,
    ) -> Result<RowOutcome, FundingError> {
        let account = tx
            .get_account(rel.account_id)
            .await?
            .ok_or(FundingError::AccountNotFound(rel.account_id))?;
        if !account.fundable() {
            debug!(
                relationship_id = %rel.id,
                account_id = %account.id,
                account_status = account.status.as_str(),
                "Account not fundable yet"
            );
            return Ok(RowOutcome::Deferred("account not fundable"));
        }

        let request = RelationshipRequest::for_relationship(&account.broker_account_id, &rel);
        let receipt = match self.broker.create_relationship(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    relationship_id = %rel.id,
                    account_id = %account.id,
                    code = e.code(),
                    error = %e,
                    "Relationship registration failed, will retry next sweep"
                );
                return Err(e.into());
            }
        };

        let status = RelationshipStatus::from_broker(&receipt.status).unwrap_or_else(|| {
            warn!(
                relationship_id = %rel.id,
                broker_status = %receipt.status,
                "Unknown broker relationship status, treating as pending"
            );
            RelationshipStatus::Pending
        });

        let from = rel.status;
        rel.broker_relationship_id = Some(receipt.id);
        rel.transition(status, Utc::now());
        tx.save_relationship(&rel).await?;
        tx.commit().await?;

        info!(
            relationship_id = %rel.id,
            account_id = %account.id,
            broker_relationship_id = ?rel.broker_relationship_id,
            status = %rel.status,
            "Relationship registered with clearing broker"
        );
        self.notify(&account, &rel).await;
        Ok(RowOutcome::transitioned(from.as_str(), rel.status.as_str()))
    }

    /// Best effort, after commit
    async fn notify(&self, account: &Account, rel: &AchRelationship) {
        let notification = Notification::RelationshipUpdated {
            relationship_id: rel.id,
            status: rel.status,
        };
        if let Err(e) = self.notifier.notify(account, notification).await {
            warn!(
                relationship_id = %rel.id,
                account_id = %account.id,
                error = %e,
                "Relationship notification failed"
            );
        }
    }
}
