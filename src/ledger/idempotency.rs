//! Idempotency Guard
//!
//! A transfer reference is reserved by inserting its record inside the
//! transfer's own transaction. The unique index on `reference` makes the
//! reservation race-free: a concurrent transaction with the same reference
//! either waits on the index entry or fails with `DuplicateReference`, and a
//! rolled-back transfer frees its reference again.

use tracing::debug;

use super::error::LedgerError;
use super::txn::Transaction;
use super::types::{AccountId, Amount, NewTransfer, TransferRecord};

/// Outcome of reserving a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Newly inserted PENDING record owned by this transaction
    Fresh(TransferRecord),
    /// A record with this reference already exists
    Existing(TransferRecord),
}

impl Reservation {
    pub fn record(&self) -> &TransferRecord {
        match self {
            Reservation::Fresh(r) | Reservation::Existing(r) => r,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Reservation::Fresh(_))
    }
}

/// Look up `reference`; if unused, insert a PENDING record for it
pub async fn check_and_reserve(
    tx: &mut Transaction,
    reference: &str,
    from: AccountId,
    to: AccountId,
    amount: Amount,
) -> Result<Reservation, LedgerError> {
    if let Some(existing) = tx.fetch_transfer(reference).await? {
        debug!(
            reference = %reference,
            transfer_id = existing.id,
            status = %existing.status,
            "Reference already recorded"
        );
        return Ok(Reservation::Existing(existing));
    }

    let record = tx
        .insert_transfer(&NewTransfer::pending(reference, from, to, amount))
        .await?;
    Ok(Reservation::Fresh(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::context::Context;
    use crate::ledger::store::MemoryStore;
    use crate::ledger::txn::TransactionCoordinator;
    use crate::ledger::types::{TransferStatus, TxOptions};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reserve_then_existing() {
        let coordinator = TransactionCoordinator::new(Arc::new(MemoryStore::new()));
        let ctx = Context::background();

        let mut tx = coordinator.begin(&ctx, TxOptions::default()).await.unwrap();
        let first = check_and_reserve(&mut tx, "TX-001", 1, 2, 5000).await.unwrap();
        assert!(first.is_fresh());
        assert_eq!(first.record().status, TransferStatus::Pending);

        // Same transaction sees its own reservation
        let again = check_and_reserve(&mut tx, "TX-001", 1, 2, 5000).await.unwrap();
        assert_eq!(again, Reservation::Existing(first.record().clone()));
        tx.commit().await.unwrap();

        let mut tx = coordinator.begin(&ctx, TxOptions::default()).await.unwrap();
        let later = check_and_reserve(&mut tx, "TX-001", 1, 2, 5000).await.unwrap();
        assert!(!later.is_fresh());
        assert_eq!(later.record().id, first.record().id);
    }

    #[tokio::test]
    async fn test_rollback_frees_reference() {
        let coordinator = TransactionCoordinator::new(Arc::new(MemoryStore::new()));
        let ctx = Context::background();

        let mut tx = coordinator.begin(&ctx, TxOptions::default()).await.unwrap();
        check_and_reserve(&mut tx, "TX-RB", 1, 2, 10).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = coordinator.begin(&ctx, TxOptions::default()).await.unwrap();
        let res = check_and_reserve(&mut tx, "TX-RB", 1, 2, 10).await.unwrap();
        assert!(res.is_fresh());
    }
}
