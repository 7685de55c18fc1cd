//! Ledger Error Types
//!
//! Every failure a caller can observe is one of these kinds, so callers branch
//! on the variant (or its `code()`) instead of matching message text.

use thiserror::Error;

use super::types::{AccountId, Amount, TransferRecord};

/// Ledger error
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors (no transaction opened) ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Lookup Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === Business Errors (transaction rolled back) ===
    #[error("Insufficient balance in account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        available: Amount,
        requested: Amount,
    },

    /// `existing` carries the original record when the store could read it
    #[error("Duplicate reference: {reference}")]
    DuplicateReference {
        reference: String,
        existing: Option<Box<TransferRecord>>,
    },

    // === Concurrency Errors (caller may retry) ===
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    // === System Errors ===
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
}

impl LedgerError {
    /// Stable error code for transport layers
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            LedgerError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            LedgerError::LockTimeout(_) => "LOCK_TIMEOUT",
            LedgerError::Deadlock(_) => "DEADLOCK",
            LedgerError::Cancelled(_) => "CANCELLED",
            LedgerError::TransactionAborted(_) => "TRANSACTION_ABORTED",
        }
    }

    /// Whether re-running the whole operation may succeed.
    ///
    /// The ledger never retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrentModification(_)
                | LedgerError::LockTimeout(_)
                | LedgerError::Deadlock(_)
        )
    }

    pub fn duplicate(reference: &str, existing: Option<TransferRecord>) -> Self {
        LedgerError::DuplicateReference {
            reference: reference.to_string(),
            existing: existing.map(Box::new),
        }
    }

    /// Original record attached to a `DuplicateReference`
    pub fn existing_record(&self) -> Option<&TransferRecord> {
        match self {
            LedgerError::DuplicateReference { existing, .. } => existing.as_deref(),
            _ => None,
        }
    }
}

/// PostgreSQL SQLSTATE codes the ledger distinguishes
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        let code = e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());

        match code.as_deref() {
            Some(sqlstate::DEADLOCK_DETECTED) => LedgerError::Deadlock(e.to_string()),
            Some(sqlstate::LOCK_NOT_AVAILABLE) => LedgerError::LockTimeout(e.to_string()),
            Some(sqlstate::SERIALIZATION_FAILURE) => {
                LedgerError::ConcurrentModification(e.to_string())
            }
            Some(sqlstate::QUERY_CANCELED) => LedgerError::Cancelled(e.to_string()),
            _ => LedgerError::TransactionAborted(e.to_string()),
        }
    }
}
