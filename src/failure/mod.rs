//! Failure capture
//!
//! Queue messages that cannot be processed are written to `trade_failures`
//! for operator follow-up. Nothing in this subsystem retries them.

pub mod recorder;
pub mod types;

pub use recorder::FailureRecorder;
pub use types::{FailureReason, TradeFailure};
