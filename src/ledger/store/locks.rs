//! Row Lock Manager
//!
//! Exclusive, re-entrant row locks owned by a transaction until it ends.
//! Waiters block on a [`Notify`] and re-check on every release. A wait-for
//! graph (each waiting transaction waits on exactly one owner) is walked before
//! blocking so that lock cycles fail fast with `Deadlock`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ledger::error::LedgerError;
use crate::ledger::types::AccountId;

/// Store transaction id
pub type TxId = u64;

/// Lockable row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Account(AccountId),
    /// Unique-index entry of `transfer_records.reference`
    Reference(String),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Account(id) => write!(f, "accounts/{}", id),
            RowKey::Reference(r) => write!(f, "transfer_records/{}", r),
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    owners: HashMap<RowKey, TxId>,
    /// waiter -> owner it is blocked on
    waits_for: HashMap<TxId, TxId>,
}

impl LockTable {
    /// Would `waiter` blocking on `owner` close a cycle?
    fn closes_cycle(&self, waiter: TxId, owner: TxId) -> bool {
        let mut current = owner;
        // Each hop visits a distinct waiter, so the chain is bounded
        for _ in 0..=self.waits_for.len() {
            if current == waiter {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(&next) => current = next,
                None => return false,
            }
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

/// Removes the wait-for edge when the waiting future finishes or is dropped
struct WaitEdge<'a> {
    manager: &'a LockManager,
    tx: TxId,
}

impl Drop for WaitEdge<'_> {
    fn drop(&mut self) {
        self.manager.table.lock().waits_for.remove(&self.tx);
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` for `tx`, waiting at most `timeout`.
    ///
    /// Re-acquiring a lock already held by `tx` returns immediately.
    pub async fn acquire(
        &self,
        tx: TxId,
        key: RowKey,
        timeout: Option<Duration>,
    ) -> Result<(), LedgerError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        loop {
            // Registered before inspecting the table so a release between the
            // check and the await is not missed
            let notified = self.released.notified();

            {
                let mut table = self.table.lock();
                match table.owners.get(&key).copied() {
                    None => {
                        table.owners.insert(key, tx);
                        return Ok(());
                    }
                    Some(owner) if owner == tx => return Ok(()),
                    Some(owner) => {
                        if table.closes_cycle(tx, owner) {
                            warn!(tx = tx, owner = owner, row = %key, "Deadlock detected");
                            return Err(LedgerError::Deadlock(format!(
                                "tx {} waiting for {} held by tx {}",
                                tx, key, owner
                            )));
                        }
                        table.waits_for.insert(tx, owner);
                        debug!(tx = tx, owner = owner, row = %key, "Waiting for row lock");
                    }
                }
            }

            let _edge = WaitEdge { manager: self, tx };
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(LedgerError::LockTimeout(format!(
                            "tx {} waited {}ms for {}",
                            tx,
                            started.elapsed().as_millis(),
                            key
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release every lock held by `tx` and wake all waiters
    pub fn release_all(&self, tx: TxId) {
        let released = {
            let mut table = self.table.lock();
            let before = table.owners.len();
            table.owners.retain(|_, owner| *owner != tx);
            table.waits_for.remove(&tx);
            before - table.owners.len()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
    }

    pub fn owner_of(&self, key: &RowKey) -> Option<TxId> {
        self.table.lock().owners.get(key).copied()
    }

    pub fn held_count(&self) -> usize {
        self.table.lock().owners.len()
    }
}
