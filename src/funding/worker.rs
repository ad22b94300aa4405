//! Funding Worker
//!
//! One sweep: load every actionable relationship and transfer, then step
//! each through its state machine sequentially. A row that errors or
//! panics is rolled back and counted; the sweep moves on to the next row.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::error::FundingError;
use super::relationship::RelationshipHandler;
use super::transfer::TransferHandler;
use super::{RowOutcome, panic_message};
use crate::store::Store;

/// Per-sweep tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub relationships: usize,
    pub transfers: usize,
    pub transitioned: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl SweepReport {
    fn tally(&mut self, result: Result<Result<RowOutcome, FundingError>, String>, row: &str) {
        match result {
            Ok(Ok(RowOutcome::Transitioned { from, to })) => {
                debug!(row, from, to, "Row transitioned");
                self.transitioned += 1;
            }
            Ok(Ok(RowOutcome::Deferred(reason))) => {
                debug!(row, reason, "Row deferred");
                self.deferred += 1;
            }
            Ok(Ok(RowOutcome::Skipped)) => self.skipped += 1,
            Ok(Err(e)) => {
                warn!(row, code = e.code(), error = %e, "Row failed, left for next sweep");
                self.failed += 1;
            }
            Err(panic) => {
                error!(row, panic = %panic, "Row handler panicked, rolled back");
                self.panicked += 1;
            }
        }
    }
}

pub struct FundingWorker {
    store: Arc<dyn Store>,
    relationships: RelationshipHandler,
    transfers: TransferHandler,
}

impl FundingWorker {
    pub fn new(
        store: Arc<dyn Store>,
        relationships: RelationshipHandler,
        transfers: TransferHandler,
    ) -> Self {
        Self {
            store,
            relationships,
            transfers,
        }
    }

    /// Run one full pass
    pub async fn sweep(&self) -> Result<SweepReport, FundingError> {
        let mut report = SweepReport::default();

        let relationships = self.store.actionable_relationships().await?;
        report.relationships = relationships.len();
        for rel in &relationships {
            let result = AssertUnwindSafe(self.relationships.process(rel.id))
                .catch_unwind()
                .await
                .map_err(|p| panic_message(p.as_ref()));
            report.tally(result, &format!("relationship:{}", rel.id));
        }

        let transfers = self.store.actionable_transfers().await?;
        report.transfers = transfers.len();
        for transfer in &transfers {
            let result = AssertUnwindSafe(self.transfers.process(transfer.id))
                .catch_unwind()
                .await
                .map_err(|p| panic_message(p.as_ref()));
            report.tally(result, &format!("transfer:{}", transfer.id));
        }

        if report.transitioned > 0 || report.failed > 0 || report.panicked > 0 {
            info!(
                relationships = report.relationships,
                transfers = report.transfers,
                transitioned = report.transitioned,
                deferred = report.deferred,
                failed = report.failed,
                panicked = report.panicked,
                "Funding sweep complete"
            );
        } else {
            debug!(
                relationships = report.relationships,
                transfers = report.transfers,
                "Funding sweep complete, nothing advanced"
            );
        }
        Ok(report)
    }
}
