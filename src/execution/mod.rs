//! Execution Reconciliation
//!
//! Two queue-driven engines share one consumer loop:
//! - [`OrderReconciler`]: settlement confirmations → orders, positions
//! - [`CancelReconciler`]: cancel rejections → order un-wind
//!
//! Each message is handled in its own transaction, one at a time per
//! subscription. Messages that fail are recorded as trade failures where
//! appropriate and nacked for the transport to redeliver or dead-letter.

pub mod cancel;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod liveness;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use cancel::CancelReconciler;
pub use consumer::{MessageHandler, Outcome};
pub use engine::OrderReconciler;
pub use error::ReconError;
pub use liveness::Liveness;
pub use types::{CancelRejectMessage, Execution, ExecutionMessage, ExecutionType, IdempotencyKey};
