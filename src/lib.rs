//! Atomic Ledger - Transactional Transfer Engine
//!
//! Accounts, idempotent transfers and nested transactions on a transactional
//! store.
//!
//! # Modules
//!
//! - [`ledger`] - Transfer engine: store, coordinator, orchestrator
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool management

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;

// Convenient re-exports at crate root
pub use ledger::{
    Context, LedgerError, MemoryStore, PgLedgerStore, TransactionCoordinator,
    TransferOrchestrator, TransferRecord, TransferRequest,
};
