//! Concurrency Control
//!
//! Two ways to keep concurrent transfers from corrupting balances:
//!
//! - **Pessimistic**: both rows are locked `FOR UPDATE` before the balance
//!   check, so the check and the write see the same values.
//! - **Optimistic**: rows are read without locks and written with a
//!   `version = expected` predicate; a writer that lost the race affects zero
//!   rows and fails with `ConcurrentModification`.
//!
//! Locks are always taken in ascending account-id order, so two transfers in
//! opposite directions between the same accounts queue instead of deadlocking.

use super::error::LedgerError;
use super::txn::Transaction;
use super::types::{Account, AccountId, AccountUpdate, Amount, LockMode, LockStrategy};

/// Source and destination rows as read for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPair {
    pub source: Account,
    pub destination: Account,
}

/// Ids in the order rows are locked and written
#[inline]
fn ordered(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Read both accounts of a transfer, locking them for the pessimistic strategy
pub async fn acquire_pair(
    tx: &mut Transaction,
    strategy: LockStrategy,
    from: AccountId,
    to: AccountId,
) -> Result<AccountPair, LedgerError> {
    let lock = match strategy {
        LockStrategy::Pessimistic => LockMode::Exclusive,
        LockStrategy::Optimistic => LockMode::Unlocked,
    };

    let (first, second) = ordered(from, to);
    let first_row = tx.account(first, lock).await?;
    let second_row = tx.account(second, lock).await?;

    let (source, destination) = if first == from {
        (first_row, second_row)
    } else {
        (second_row, first_row)
    };
    Ok(AccountPair {
        source,
        destination,
    })
}

/// Move `amount` from `pair.source` to `pair.destination`.
///
/// The caller has checked the source balance against the values in `pair`.
pub async fn apply_transfer(
    tx: &mut Transaction,
    strategy: LockStrategy,
    pair: &AccountPair,
    amount: Amount,
) -> Result<(), LedgerError> {
    let (debit, credit) = match strategy {
        LockStrategy::Pessimistic => (
            AccountUpdate::for_account(pair.source.id).debit(amount),
            AccountUpdate::for_account(pair.destination.id).credit(amount),
        ),
        LockStrategy::Optimistic => {
            let debited = pair.source.balance.checked_sub(amount);
            let credited = pair.destination.balance.checked_add(amount);
            let (Some(debited), Some(credited)) = (debited, credited) else {
                return Err(LedgerError::InvalidRequest(format!(
                    "amount {} overflows account balance",
                    amount
                )));
            };
            (
                AccountUpdate::for_account(pair.source.id)
                    .expect_version(pair.source.version)
                    .set_balance(debited),
                AccountUpdate::for_account(pair.destination.id)
                    .expect_version(pair.destination.version)
                    .set_balance(credited),
            )
        }
    };

    let writes = if pair.source.id <= pair.destination.id {
        [debit, credit]
    } else {
        [credit, debit]
    };

    for update in &writes {
        let rows = tx.update_account(update).await?;
        if rows == 0 {
            return Err(match strategy {
                LockStrategy::Optimistic => LedgerError::ConcurrentModification(format!(
                    "account {} changed since it was read",
                    update.id
                )),
                // The row was locked, so it can only have vanished
                LockStrategy::Pessimistic => LedgerError::TransactionAborted(format!(
                    "account {} not updated",
                    update.id
                )),
            });
        }
    }
    Ok(())
}

/// Apply a version-guarded update, failing if it matched no row
pub async fn compare_and_swap(
    tx: &mut Transaction,
    update: &AccountUpdate,
) -> Result<(), LedgerError> {
    match tx.update_account(update).await? {
        0 => Err(LedgerError::ConcurrentModification(format!(
            "account {} version mismatch",
            update.id
        ))),
        _ => Ok(()),
    }
}
