//! Ledger Core Types
//!
//! Rows owned by the ledger store and the request/option types that flow
//! through the transaction coordinator.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account primary key
pub type AccountId = i64;

/// Transfer record primary key
pub type TransferId = i64;

/// Amount in integer minor units (e.g. cents). Never fractional.
pub type Amount = i64;

/// Maximum length of a transfer reference (matches `VARCHAR(64)`)
pub const MAX_REFERENCE_LEN: usize = 64;

/// Ledger account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Amount,
    /// Bumped by exactly one on every successful update of the row
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account to be created during seeding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub id: AccountId,
    pub name: String,
    pub balance: Amount,
}

impl NewAccount {
    pub fn new(id: AccountId, name: impl Into<String>, balance: Amount) -> Self {
        Self {
            id,
            name: name.into(),
            balance,
        }
    }
}

/// Transfer record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Reference reserved, balances not yet moved
    Pending,
    /// Debit and credit applied
    Success,
    Failed,
    /// Some legs of a batch were rolled back
    Partial,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Partial => "PARTIAL",
        }
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "SUCCESS" => Ok(TransferStatus::Success),
            "FAILED" => Ok(TransferStatus::Failed),
            "PARTIAL" => Ok(TransferStatus::Partial),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

/// Transfer record row. One per reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub reference: String,
    pub from_id: AccountId,
    pub to_id: AccountId,
    pub amount: Amount,
    pub status: TransferStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    /// True when the record describes the same movement as the given request
    pub fn matches(&self, from: AccountId, to: AccountId, amount: Amount) -> bool {
        self.from_id == from && self.to_id == to && self.amount == amount
    }
}

/// Transfer record to be inserted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTransfer {
    pub reference: String,
    pub from_id: AccountId,
    pub to_id: AccountId,
    pub amount: Amount,
    pub status: TransferStatus,
    pub message: String,
}

impl NewTransfer {
    /// Reservation row written by the idempotency guard
    pub fn pending(reference: &str, from_id: AccountId, to_id: AccountId, amount: Amount) -> Self {
        Self {
            reference: reference.to_string(),
            from_id,
            to_id,
            amount,
            status: TransferStatus::Pending,
            message: String::new(),
        }
    }

}

/// Audit trail row written by the audit interceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the store on commit; zero before that
    pub id: i64,
    pub operator: String,
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    /// JSON payload describing the mutation
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Field mask for account updates
// ============================================================================

/// Balance column change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum BalanceChange {
    /// `balance = value` (optimistic path writes the computed value)
    Set(Amount),
    /// `balance = balance - value`
    Debit(Amount),
    /// `balance = balance + value`
    Credit(Amount),
}

impl BalanceChange {
    /// Resulting balance, `None` on overflow
    pub fn apply(&self, current: Amount) -> Option<Amount> {
        match *self {
            BalanceChange::Set(v) => Some(v),
            BalanceChange::Debit(v) => current.checked_sub(v),
            BalanceChange::Credit(v) => current.checked_add(v),
        }
    }
}

/// Row predicate on the version column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", content = "version", rename_all = "snake_case")]
pub enum VersionGuard {
    #[default]
    Any,
    /// `WHERE version = v`
    Expect(i64),
}

/// Update of an account row.
///
/// The mutable columns are enumerated here; `version` and `updated_at` are
/// maintained by the store and always change together with the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountUpdate {
    pub id: AccountId,
    pub guard: VersionGuard,
    pub balance: Option<BalanceChange>,
    pub name: Option<String>,
}

impl AccountUpdate {
    pub fn for_account(id: AccountId) -> Self {
        Self {
            id,
            guard: VersionGuard::Any,
            balance: None,
            name: None,
        }
    }

    pub fn expect_version(mut self, version: i64) -> Self {
        self.guard = VersionGuard::Expect(version);
        self
    }

    pub fn set_balance(mut self, balance: Amount) -> Self {
        self.balance = Some(BalanceChange::Set(balance));
        self
    }

    pub fn debit(mut self, amount: Amount) -> Self {
        self.balance = Some(BalanceChange::Debit(amount));
        self
    }

    pub fn credit(mut self, amount: Amount) -> Self {
        self.balance = Some(BalanceChange::Credit(amount));
        self
    }

    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// No column other than the store-maintained ones would change
    pub fn is_empty(&self) -> bool {
        self.balance.is_none() && self.name.is_none()
    }
}

// ============================================================================
// Transaction options
// ============================================================================

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Reads come from a snapshot taken when the transaction began
    #[inline]
    pub fn uses_snapshot(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// Row lock requested on a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Plain read, no lock taken
    Unlocked,
    /// `SELECT ... FOR UPDATE`, held until the transaction ends
    Exclusive,
}

/// Concurrency control strategy for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    #[default]
    Pessimistic,
    Optimistic,
}

impl LockStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStrategy::Pessimistic => "pessimistic",
            LockStrategy::Optimistic => "optimistic",
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options applied when a transaction begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    /// Upper bound on a single row-lock wait; `None` blocks until granted
    pub lock_timeout: Option<Duration>,
    /// Server-side bound on one statement, derived from the context deadline
    pub statement_timeout: Option<Duration>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Tighten the statement timeout; an existing shorter bound wins
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(match self.statement_timeout {
            Some(current) if current < timeout => current,
            _ => timeout,
        });
        self
    }
}

/// Transfer request as received from the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    /// Client-supplied idempotency key
    pub reference: String,
    /// Falls back to the configured default when absent
    #[serde(default)]
    pub strategy: Option<LockStrategy>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Amount, reference: impl Into<String>) -> Self {
        Self {
            from,
            to,
            amount,
            reference: reference.into(),
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: LockStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_status_str() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Success,
            TransferStatus::Failed,
            TransferStatus::Partial,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>(), Ok(status));
        }
        assert!("DONE".parse::<TransferStatus>().is_err());
        assert!(!TransferStatus::Pending.is_final());
        assert!(TransferStatus::Partial.is_final());
    }

    #[test]
    fn test_transfer_status_serde() {
        let json = serde_json::to_string(&TransferStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }

    #[test]
    fn test_balance_change_apply() {
        assert_eq!(BalanceChange::Debit(30).apply(100), Some(70));
        assert_eq!(BalanceChange::Credit(30).apply(100), Some(130));
        assert_eq!(BalanceChange::Set(5).apply(100), Some(5));
        assert_eq!(BalanceChange::Credit(1).apply(i64::MAX), None);
    }

    #[test]
    fn test_account_update_builder() {
        let update = AccountUpdate::for_account(7)
            .expect_version(3)
            .set_balance(900)
            .rename("Alice Corp");

        assert_eq!(update.id, 7);
        assert_eq!(update.guard, VersionGuard::Expect(3));
        assert_eq!(update.balance, Some(BalanceChange::Set(900)));
        assert_eq!(update.name.as_deref(), Some("Alice Corp"));
        assert!(!update.is_empty());
        assert!(AccountUpdate::for_account(7).is_empty());
    }

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::default().as_sql(), "READ COMMITTED");
        assert!(!IsolationLevel::ReadCommitted.uses_snapshot());
        assert!(IsolationLevel::Serializable.uses_snapshot());
    }

    #[test]
    fn test_statement_timeout_only_tightens() {
        let opts = TxOptions::default().with_statement_timeout(Duration::from_millis(200));
        assert_eq!(
            opts.with_statement_timeout(Duration::from_secs(1)).statement_timeout,
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            opts.with_statement_timeout(Duration::from_millis(50)).statement_timeout,
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_lock_strategy_serde() {
        let s: LockStrategy = serde_yaml::from_str("optimistic").unwrap();
        assert_eq!(s, LockStrategy::Optimistic);
        assert_eq!(LockStrategy::default(), LockStrategy::Pessimistic);
    }

    #[test]
    fn test_transfer_request_defaults() {
        let req = TransferRequest::new(1, 2, 5000, "TX-001");
        assert_eq!(req.strategy, None);
        let req = req.with_strategy(LockStrategy::Optimistic);
        assert_eq!(req.strategy, Some(LockStrategy::Optimistic));
    }
}
