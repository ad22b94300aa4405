//! ACH Funding
//!
//! Periodic sweep over bank relationships and transfers:
//!
//! - [`RelationshipHandler`]: bank-link registration with the clearing broker
//! - [`TransferHandler`]: balance-checked deposit / withdrawal submission
//! - [`FundingWorker`]: one sequential pass over every actionable row
//! - [`FundingScheduler`]: fixed-interval trigger, single-flighted so two
//!   passes never overlap
//!
//! Each row is one transaction. A row that cannot advance is rolled back
//! and looked at again on the next pass; there is no other retry schedule.

pub mod error;
pub mod relationship;
pub mod scheduler;
pub mod state;
pub mod transfer;
pub mod types;
pub mod worker;


use std::any::Any;

pub use error::FundingError;
pub use relationship::RelationshipHandler;
pub use scheduler::{Flight, FundingScheduler, SingleFlight};
pub use state::{RelationshipStatus, TransferStatus};
pub use transfer::TransferHandler;
pub use types::{AchRelationship, ApprovalMethod, Transfer, TransferDirection};
pub use worker::{FundingWorker, SweepReport};

/// What one state-machine step did to its row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Committed a status change
    Transitioned {
        from: &'static str,
        to: &'static str,
    },
    /// Preconditions not met yet; rolled back for the next sweep
    Deferred(&'static str),
    /// Nothing to do
    Skipped,
}

impl RowOutcome {
    pub fn transitioned(from: &'static str, to: &'static str) -> Self {
        RowOutcome::Transitioned { from, to }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
