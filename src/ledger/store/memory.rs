//! In-Memory Ledger Store
//!
//! Committed tables sit behind one mutex as an `Arc<Tables>`; a transaction
//! buffers its writes in a private write set and publishes them in a single
//! critical section on commit, so no reader ever sees half a transaction.
//!
//! Row locks come from [`LockManager`]. Snapshot isolation levels keep the
//! `Arc<Tables>` taken at begin; commits copy-on-write while snapshots are
//! alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::locks::{LockManager, RowKey, TxId};
use super::{LedgerStore, StoreTx};
use crate::ledger::error::LedgerError;
use crate::ledger::types::{
    Account, AccountId, AccountUpdate, AuditEntry, LockMode, NewAccount, NewTransfer,
    TransferId, TransferRecord, TransferStatus, TxOptions, VersionGuard,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, TransferRecord>,
    /// Unique index on `transfer_records.reference`
    references: HashMap<String, TransferId>,
    audit: Vec<AuditEntry>,
}

impl Tables {
    fn transfer_by_reference(&self, reference: &str) -> Option<&TransferRecord> {
        self.references
            .get(reference)
            .and_then(|id| self.transfers.get(id))
    }
}

/// Uncommitted writes of one transaction
#[derive(Debug, Clone, Default)]
struct WriteSet {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, TransferRecord>,
    audit: Vec<AuditEntry>,
}

impl WriteSet {
    fn transfer_by_reference(&self, reference: &str) -> Option<&TransferRecord> {
        self.transfers.values().find(|t| t.reference == reference)
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Arc<Tables>>,
    locks: LockManager,
    next_tx: AtomicU64,
    /// Like a sequence: ids are never handed out twice, even after rollback
    next_transfer_id: AtomicI64,
    default_lock_timeout: Option<Duration>,
}

impl Shared {
    fn committed(&self) -> Arc<Tables> {
        self.tables.lock().clone()
    }
}

/// In-process ledger store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Lock timeout used by transactions that do not set their own
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(default_lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Arc::new(Tables::default())),
                locks: LockManager::new(),
                next_tx: AtomicU64::new(0),
                next_transfer_id: AtomicI64::new(0),
                default_lock_timeout,
            }),
        }
    }

    /// Row locks currently held by open transactions
    pub fn held_locks(&self) -> usize {
        self.shared.locks.held_count()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn StoreTx>, LedgerError> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = if opts.isolation.uses_snapshot() {
            Some(self.shared.committed())
        } else {
            None
        };

        debug!(tx = id, isolation = opts.isolation.as_sql(), "Memory tx begin");
        Ok(Box::new(MemoryTx {
            id,
            shared: self.shared.clone(),
            opts,
            snapshot,
            writes: WriteSet::default(),
            savepoints: Vec::new(),
            done: false,
        }))
    }
}

/// Open in-memory transaction
pub struct MemoryTx {
    id: TxId,
    shared: Arc<Shared>,
    opts: TxOptions,
    snapshot: Option<Arc<Tables>>,
    writes: WriteSet,
    savepoints: Vec<(String, WriteSet)>,
    done: bool,
}

impl MemoryTx {
    /// Tables plain reads are served from
    fn read_view(&self) -> Arc<Tables> {
        match &self.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => self.shared.committed(),
        }
    }

    fn lock_timeout(&self) -> Option<Duration> {
        self.opts.lock_timeout.or(self.shared.default_lock_timeout)
    }

    async fn lock_row(&self, key: RowKey) -> Result<(), LedgerError> {
        self.shared
            .locks
            .acquire(self.id, key, self.lock_timeout())
            .await
    }

    fn ensure_writable(&self) -> Result<(), LedgerError> {
        if self.opts.read_only {
            return Err(LedgerError::TransactionAborted(
                "cannot execute write in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock an account row and return its latest committed version.
    ///
    /// Under snapshot isolation a row changed since the snapshot cannot be
    /// locked or written.
    async fn lock_latest_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        if !self.shared.committed().accounts.contains_key(&id) {
            return Ok(None);
        }

        self.lock_row(RowKey::Account(id)).await?;
        let latest = match self.shared.committed().accounts.get(&id) {
            Some(account) => account.clone(),
            None => return Ok(None),
        };

        if let Some(snapshot) = &self.snapshot {
            // Created after the snapshot: invisible, as under REPEATABLE READ
            let Some(seen) = snapshot.accounts.get(&id).map(|a| a.version) else {
                return Ok(None);
            };
            if seen != latest.version {
                return Err(LedgerError::ConcurrentModification(format!(
                    "could not serialize access due to concurrent update of account {}",
                    id
                )));
            }
        }
        Ok(Some(latest))
    }

    fn finish(&mut self) {
        self.done = true;
        self.savepoints.clear();
        self.shared.locks.release_all(self.id);
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.done {
            debug!(tx = self.id, "Memory tx dropped without commit, rolling back");
            self.finish();
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn id(&self) -> u64 {
        self.id
    }

    async fn fetch_account(
        &mut self,
        id: AccountId,
        lock: LockMode,
    ) -> Result<Option<Account>, LedgerError> {
        // Own writes already hold the row lock
        if let Some(account) = self.writes.accounts.get(&id) {
            return Ok(Some(account.clone()));
        }

        match lock {
            LockMode::Unlocked => Ok(self.read_view().accounts.get(&id).cloned()),
            LockMode::Exclusive => self.lock_latest_account(id).await,
        }
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError> {
        let mut merged = self.read_view().accounts.clone();
        for (id, account) in &self.writes.accounts {
            merged.insert(*id, account.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account, LedgerError> {
        self.ensure_writable()?;
        if account.balance < 0 {
            return Err(LedgerError::InvalidRequest(format!(
                "account {} cannot open with negative balance {}",
                account.id, account.balance
            )));
        }

        self.lock_row(RowKey::Account(account.id)).await?;
        if self.writes.accounts.contains_key(&account.id)
            || self.shared.committed().accounts.contains_key(&account.id)
        {
            return Err(LedgerError::TransactionAborted(format!(
                "duplicate key value violates unique constraint \"accounts_pkey\" (id={})",
                account.id
            )));
        }

        let now = Utc::now();
        let row = Account {
            id: account.id,
            name: account.name.clone(),
            balance: account.balance,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.writes.accounts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_account(&mut self, update: &AccountUpdate) -> Result<u64, LedgerError> {
        self.ensure_writable()?;

        let current = match self.writes.accounts.get(&update.id) {
            Some(account) => account.clone(),
            None => match self.lock_latest_account(update.id).await? {
                Some(account) => account,
                None => return Ok(0),
            },
        };

        if let VersionGuard::Expect(expected) = update.guard
            && current.version != expected
        {
            debug!(
                tx = self.id,
                account_id = update.id,
                expected,
                actual = current.version,
                "Version guard matched no rows"
            );
            return Ok(0);
        }

        let mut next = current.clone();
        if let Some(change) = update.balance {
            let balance = change.apply(current.balance).ok_or_else(|| {
                LedgerError::TransactionAborted(format!(
                    "balance of account {} out of range",
                    update.id
                ))
            })?;
            if balance < 0 {
                return Err(LedgerError::InsufficientBalance {
                    account_id: update.id,
                    available: current.balance,
                    requested: current.balance - balance,
                });
            }
            next.balance = balance;
        }
        if let Some(name) = &update.name {
            next.name = name.clone();
        }
        next.version += 1;
        next.updated_at = Utc::now();

        self.writes.accounts.insert(next.id, next);
        Ok(1)
    }

    async fn fetch_transfer(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        if let Some(record) = self.writes.transfer_by_reference(reference) {
            return Ok(Some(record.clone()));
        }
        Ok(self.read_view().transfer_by_reference(reference).cloned())
    }

    async fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, LedgerError> {
        let mut merged = self.read_view().transfers.clone();
        for (id, record) in &self.writes.transfers {
            merged.insert(*id, record.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
    ) -> Result<TransferRecord, LedgerError> {
        self.ensure_writable()?;

        // Blocks while another open transaction holds the same reference
        self.lock_row(RowKey::Reference(transfer.reference.clone()))
            .await?;

        if let Some(existing) = self.writes.transfer_by_reference(&transfer.reference) {
            return Err(LedgerError::duplicate(
                &transfer.reference,
                Some(existing.clone()),
            ));
        }
        // The unique index sees every committed row regardless of snapshot
        if let Some(existing) = self
            .shared
            .committed()
            .transfer_by_reference(&transfer.reference)
        {
            return Err(LedgerError::duplicate(
                &transfer.reference,
                Some(existing.clone()),
            ));
        }

        let id = self.shared.next_transfer_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = TransferRecord {
            id,
            reference: transfer.reference.clone(),
            from_id: transfer.from_id,
            to_id: transfer.to_id,
            amount: transfer.amount,
            status: transfer.status,
            message: transfer.message.clone(),
            created_at: Utc::now(),
        };
        self.writes.transfers.insert(id, record.clone());
        Ok(record)
    }

    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        status: TransferStatus,
        message: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        self.ensure_writable()?;

        let current = match self.writes.transfers.get(&id) {
            Some(record) => record.clone(),
            None => {
                let committed = match self.shared.committed().transfers.get(&id) {
                    Some(record) => record.clone(),
                    None => return Ok(None),
                };
                self.lock_row(RowKey::Reference(committed.reference.clone()))
                    .await?;
                match self.shared.committed().transfers.get(&id) {
                    Some(record) => record.clone(),
                    None => return Ok(None),
                }
            }
        };

        let mut next = current;
        next.status = status;
        next.message = message.to_string();
        self.writes.transfers.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<(), LedgerError> {
        self.ensure_writable()?;
        self.writes.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&mut self) -> Result<Vec<AuditEntry>, LedgerError> {
        let mut entries = self.read_view().audit.clone();
        entries.extend(self.writes.audit.iter().cloned());
        Ok(entries)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), LedgerError> {
        self.savepoints
            .push((name.to_string(), self.writes.clone()));
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), LedgerError> {
        let idx = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                LedgerError::TransactionAborted(format!("savepoint \"{}\" does not exist", name))
            })?;

        // The savepoint itself survives a rollback to it
        self.writes = self.savepoints[idx].1.clone();
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    async fn release(&mut self, name: &str) -> Result<(), LedgerError> {
        let idx = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                LedgerError::TransactionAborted(format!("savepoint \"{}\" does not exist", name))
            })?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let mut this = self;
        let writes = std::mem::take(&mut this.writes);
        {
            let mut guard = this.shared.tables.lock();
            let tables = Arc::make_mut(&mut *guard);

            tables.accounts.extend(writes.accounts);
            for (id, record) in writes.transfers {
                tables.references.insert(record.reference.clone(), id);
                tables.transfers.insert(id, record);
            }
            for mut entry in writes.audit {
                entry.id = tables.audit.len() as i64 + 1;
                tables.audit.push(entry);
            }
        }

        debug!(tx = this.id, "Memory tx committed");
        this.finish();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        let mut this = self;
        debug!(tx = this.id, "Memory tx rolled back");
        this.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::IsolationLevel;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.insert_account(&NewAccount::new(1, "Alice Corp", 100_000))
            .await
            .unwrap();
        tx.insert_account(&NewAccount::new(2, "Bob Studio", 30_000))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store
    }

    async fn balance(store: &MemoryStore, id: AccountId) -> i64 {
        let mut tx = store.begin(TxOptions::read_only()).await.unwrap();
        let account = tx
            .fetch_account(id, LockMode::Unlocked)
            .await
            .unwrap()
            .unwrap();
        tx.rollback().await.unwrap();
        account.balance
    }

    #[tokio::test]
    async fn test_uncommitted_writes_invisible() {
        let store = seeded().await;

        let mut writer = store.begin(TxOptions::default()).await.unwrap();
        writer
            .update_account(&AccountUpdate::for_account(1).debit(5_000))
            .await
            .unwrap();

        assert_eq!(balance(&store, 1).await, 100_000);
        writer.commit().await.unwrap();
        assert_eq!(balance(&store, 1).await, 95_000);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes_and_locks() {
        let store = seeded().await;

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.update_account(&AccountUpdate::for_account(1).debit(5_000))
            .await
            .unwrap();
        assert_eq!(store.held_locks(), 1);
        tx.rollback().await.unwrap();

        assert_eq!(store.held_locks(), 0);
        assert_eq!(balance(&store, 1).await, 100_000);
    }

    #[tokio::test]
    async fn test_drop_releases_locks() {
        let store = seeded().await;
        {
            let mut tx = store.begin(TxOptions::default()).await.unwrap();
            tx.fetch_account(1, LockMode::Exclusive).await.unwrap();
            assert_eq!(store.held_locks(), 1);
        }
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_version_guard() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();

        let rows = tx
            .update_account(&AccountUpdate::for_account(1).expect_version(0).set_balance(90_000))
            .await
            .unwrap();
        assert_eq!(rows, 1);

        // Stale version affects nothing
        let rows = tx
            .update_account(&AccountUpdate::for_account(1).expect_version(0).set_balance(1))
            .await
            .unwrap();
        assert_eq!(rows, 0);

        let account = tx
            .fetch_account(1, LockMode::Unlocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, 90_000);
        assert_eq!(account.version, 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_account_affects_nothing() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let rows = tx
            .update_account(&AccountUpdate::for_account(999).credit(1))
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_negative_balance_rejected() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let err = tx
            .update_account(&AccountUpdate::for_account(2).debit(30_001))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                account_id: 2,
                available: 30_000,
                requested: 30_001
            }
        ));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_to() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();

        tx.update_account(&AccountUpdate::for_account(1).debit(2_000))
            .await
            .unwrap();
        tx.savepoint("after_debit").await.unwrap();
        tx.update_account(&AccountUpdate::for_account(2).credit(2_000))
            .await
            .unwrap();
        tx.rollback_to("after_debit").await.unwrap();

        // Rolling back again to the same savepoint is allowed
        tx.rollback_to("after_debit").await.unwrap();
        tx.release("after_debit").await.unwrap();
        assert!(tx.rollback_to("after_debit").await.is_err());

        tx.commit().await.unwrap();
        assert_eq!(balance(&store, 1).await, 98_000);
        assert_eq!(balance(&store, 2).await, 30_000);
    }

    #[tokio::test]
    async fn test_unknown_savepoint() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let err = tx.rollback_to("nope").await.unwrap_err();
        assert!(matches!(err, LedgerError::TransactionAborted(_)));
    }

    #[tokio::test]
    async fn test_duplicate_reference_in_same_tx() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.insert_transfer(&NewTransfer::pending("TX-DUP", 1, 2, 10))
            .await
            .unwrap();
        let err = tx
            .insert_transfer(&NewTransfer::pending("TX-DUP", 2, 1, 5))
            .await
            .unwrap_err();
        assert_eq!(err.existing_record().map(|r| r.amount), Some(10));
    }

    #[tokio::test]
    async fn test_transfer_status_update_and_commit() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let rec = tx
            .insert_transfer(&NewTransfer::pending("TX-S", 1, 2, 10))
            .await
            .unwrap();
        let updated = tx
            .update_transfer_status(rec.id, TransferStatus::Success, "done")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TransferStatus::Success);
        tx.commit().await.unwrap();

        let mut tx = store.begin(TxOptions::read_only()).await.unwrap();
        let found = tx.fetch_transfer("TX-S").await.unwrap().unwrap();
        assert_eq!(found.id, rec.id);
        assert_eq!(found.status, TransferStatus::Success);
        assert!(tx.update_transfer_status(12345, TransferStatus::Failed, "").await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::read_only()).await.unwrap();
        let err = tx
            .update_account(&AccountUpdate::for_account(1).credit(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionAborted(_)));
    }

    #[tokio::test]
    async fn test_lock_timeout_between_transactions() {
        let store = seeded().await;
        let mut holder = store.begin(TxOptions::default()).await.unwrap();
        holder.fetch_account(1, LockMode::Exclusive).await.unwrap();

        let opts = TxOptions::default().with_lock_timeout(Duration::from_millis(20));
        let mut waiter = store.begin(opts).await.unwrap();
        let err = waiter
            .fetch_account(1, LockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout(_)));

        // Plain reads never block
        assert!(waiter.fetch_account(1, LockMode::Unlocked).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_isolation_conflict() {
        let store = seeded().await;
        let opts = TxOptions::default().with_isolation(IsolationLevel::RepeatableRead);
        let mut reader = store.begin(opts).await.unwrap();
        assert_eq!(
            reader
                .fetch_account(1, LockMode::Unlocked)
                .await
                .unwrap()
                .unwrap()
                .balance,
            100_000
        );

        let mut writer = store.begin(TxOptions::default()).await.unwrap();
        writer
            .update_account(&AccountUpdate::for_account(1).debit(1_000))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        // Snapshot still shows the old balance
        assert_eq!(
            reader
                .fetch_account(1, LockMode::Unlocked)
                .await
                .unwrap()
                .unwrap()
                .balance,
            100_000
        );
        let err = reader
            .update_account(&AccountUpdate::for_account(1).debit(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_snapshot_hides_accounts_created_later() {
        let store = seeded().await;
        let opts = TxOptions::default().with_isolation(IsolationLevel::RepeatableRead);
        let mut reader = store.begin(opts).await.unwrap();
        reader.fetch_account(1, LockMode::Unlocked).await.unwrap();

        let mut writer = store.begin(TxOptions::default()).await.unwrap();
        writer
            .insert_account(&NewAccount::new(9, "Late Ltd", 10))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        assert!(reader.fetch_account(9, LockMode::Unlocked).await.unwrap().is_none());
        assert!(reader.fetch_account(9, LockMode::Exclusive).await.unwrap().is_none());
        let rows = reader
            .update_account(&AccountUpdate::for_account(9).credit(1))
            .await
            .unwrap();
        assert_eq!(rows, 0);
        reader.rollback().await.unwrap();
        assert_eq!(store.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_audit_committed_with_transaction() {
        let store = seeded().await;
        let entry = AuditEntry {
            id: 0,
            operator: "alice".into(),
            action: "update".into(),
            entity: "accounts".into(),
            entity_id: "1".into(),
            detail: "{}".into(),
            created_at: Utc::now(),
        };

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.insert_audit(&entry).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        tx.insert_audit(&entry).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(TxOptions::read_only()).await.unwrap();
        let audit = tx.list_audit().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].id, 1);
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let store = seeded().await;
        let mut tx = store.begin(TxOptions::default()).await.unwrap();
        let err = tx
            .insert_account(&NewAccount::new(1, "again", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionAborted(_)));
    }
}
