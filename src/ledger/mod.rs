//! Transactional Transfer Ledger
//!
//! Atomic balance transfers between accounts with idempotent references,
//! pessimistic or optimistic concurrency control and savepoint-based nested
//! transactions.
//!
//! # Layers
//!
//! ```text
//! TransferOrchestrator
//!   ├── idempotency   reserve reference (unique index)
//!   ├── concurrency   lock / version-check both accounts, ascending id order
//!   └── txn           Transaction: context guard, interceptors, savepoints
//!         └── store   LedgerStore / StoreTx (memory or postgres)
//! ```

pub mod concurrency;
pub mod context;
pub mod error;
pub mod idempotency;
pub mod interceptor;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod txn;
pub mod types;


pub use context::Context;
pub use error::LedgerError;
pub use interceptor::{AuditInterceptor, Mutation, TracingInterceptor, TxInterceptor};
pub use orchestrator::{BatchReport, DuplicatePolicy, LedgerSettings, LegResult, TransferOrchestrator};
pub use state::{TransferAttempt, TransferPhase};
pub use store::{LedgerStore, MemoryStore, PgLedgerStore, StoreTx};
pub use txn::{NestedOutcome, NestedPolicy, Transaction, TransactionCoordinator};
pub use types::{
    Account, AccountId, AccountUpdate, Amount, AuditEntry, IsolationLevel, LockMode,
    LockStrategy, NewAccount, TransferRecord, TransferRequest, TransferStatus, TxOptions,
};
