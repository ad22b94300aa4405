//! Settlement Reconciliation
//!
//! Asynchronous workers that keep a brokerage's ledger in step with its
//! clearing broker.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (AccountId, OrderId, etc.)
//! - [`models`] - Orders, accounts and positions
//! - [`store`] - Transactional persistence seam (PostgreSQL + in-memory)
//! - [`queue`] - At-least-once message transport seam (Kafka / Redpanda)
//! - [`execution`] - Execution and cancel-reject reconciliation engines
//! - [`funding`] - ACH relationship / transfer state machines and sweep
//! - [`failure`] - Trade-failure recorder
//! - [`notify`] - Real-time stream publisher and user notifications
//! - [`clients`] - Clearing broker and bank-data aggregator HTTP clients
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing subscriber setup
//! - [`db`] - PostgreSQL pool and migrations

// Core types - must be first!
pub mod core_types;

pub mod models;

// Persistence & transport
pub mod db;
pub mod queue;
pub mod store;

// Workers
pub mod execution;
pub mod failure;
pub mod funding;

// Collaborators
pub mod clients;
pub mod notify;

// Service setup
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use config::{AppConfig, Mode};
pub use core_types::{AccountId, OrderId, RelationshipId, TransferId};
pub use execution::{CancelReconciler, OrderReconciler, ReconError};
pub use failure::{FailureReason, FailureRecorder, TradeFailure};
pub use funding::{FundingError, FundingScheduler, FundingWorker, SingleFlight};
pub use models::{Account, Order, OrderStatus, Position, Side};
pub use store::{PgStore, Store, StoreError, StoreTx};
