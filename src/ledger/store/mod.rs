//! Ledger Store
//!
//! The transactional store the ledger runs on. Two implementations:
//! - [`MemoryStore`]: in-process tables with row locks, savepoints and
//!   snapshot reads
//! - [`PgLedgerStore`]: PostgreSQL through `sqlx`
//!
//! Every row access happens through a [`StoreTx`]; there is no way to read or
//! write ledger rows outside a transaction.

pub mod locks;
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;

use super::error::LedgerError;
use super::types::{
    Account, AccountId, AccountUpdate, AuditEntry, LockMode, NewAccount, NewTransfer,
    TransferId, TransferRecord, TransferStatus, TxOptions,
};

/// Transaction factory
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Start a transaction
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn StoreTx>, LedgerError>;
}

/// One open store transaction.
///
/// Dropping a `StoreTx` without calling `commit` or `rollback` rolls it back
/// and releases its locks.
#[async_trait]
pub trait StoreTx: Send {
    /// Store-local transaction id, for logging
    fn id(&self) -> u64;

    // === accounts ===

    /// Read an account, optionally taking an exclusive row lock
    async fn fetch_account(
        &mut self,
        id: AccountId,
        lock: LockMode,
    ) -> Result<Option<Account>, LedgerError>;

    /// All accounts ordered by id
    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError>;

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account, LedgerError>;

    /// Conditional update; returns the number of rows affected (0 or 1).
    ///
    /// Takes the row lock implicitly, like an SQL `UPDATE`.
    async fn update_account(&mut self, update: &AccountUpdate) -> Result<u64, LedgerError>;

    // === transfer records ===

    async fn fetch_transfer(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransferRecord>, LedgerError>;

    /// All transfer records ordered by id
    async fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, LedgerError>;

    /// Insert a record; a taken reference fails with `DuplicateReference`
    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
    ) -> Result<TransferRecord, LedgerError>;

    /// Returns the updated record, `None` if the id is unknown
    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        status: TransferStatus,
        message: &str,
    ) -> Result<Option<TransferRecord>, LedgerError>;

    // === audit ===

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<(), LedgerError>;

    async fn list_audit(&mut self) -> Result<Vec<AuditEntry>, LedgerError>;

    // === savepoints ===

    async fn savepoint(&mut self, name: &str) -> Result<(), LedgerError>;

    async fn rollback_to(&mut self, name: &str) -> Result<(), LedgerError>;

    async fn release(&mut self, name: &str) -> Result<(), LedgerError>;

    // === completion ===

    /// Stop a statement still running on the server after the caller gave up
    /// on it, so that a following rollback is not queued behind it
    async fn interrupt(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}
