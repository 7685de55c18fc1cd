//! Property-based tests for ledger invariants
//!
//! - Money conservation: the balance total never changes
//! - Replay: balances equal the seed plus every committed transfer record
//! - Idempotency: one record per reference, whatever the request sequence
//! - Versions: each account's version counts the transfers that touched it

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use atomic_ledger::ledger::{
    AccountId, AuditInterceptor, Context, LedgerSettings, LockStrategy, MemoryStore, NewAccount,
    NestedPolicy, TransactionCoordinator, TransferOrchestrator, TransferRequest, TransferStatus,
};
use proptest::prelude::*;

const SEED: [(AccountId, i64); 3] = [(1, 100_000), (2, 30_000), (3, 0)];

/// Transfer parameters, including invalid ones
#[derive(Debug, Clone)]
struct Op {
    from: AccountId,
    to: AccountId,
    amount: i64,
    /// Small range so references repeat
    reference: u8,
    strategy: LockStrategy,
}

impl Op {
    fn request(&self) -> TransferRequest {
        TransferRequest::new(
            self.from,
            self.to,
            self.amount,
            format!("PROP-{}", self.reference),
        )
        .with_strategy(self.strategy)
    }
}

fn strategy_strategy() -> impl Strategy<Value = LockStrategy> {
    prop_oneof![Just(LockStrategy::Pessimistic), Just(LockStrategy::Optimistic)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (1i64..=3, 1i64..=3, -100i64..60_000, 0u8..24, strategy_strategy()).prop_map(
        |(from, to, amount, reference, strategy)| Op {
            from,
            to,
            amount,
            reference,
            strategy,
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

async fn seeded_ledger() -> TransferOrchestrator {
    let coordinator = TransactionCoordinator::new(Arc::new(MemoryStore::new()))
        .with_interceptor(Arc::new(AuditInterceptor));
    let ledger = TransferOrchestrator::new(coordinator, LedgerSettings::default());
    let accounts: Vec<NewAccount> = SEED
        .iter()
        .map(|&(id, balance)| NewAccount::new(id, format!("acct-{}", id), balance))
        .collect();
    ledger
        .seed(&Context::background(), &accounts)
        .await
        .expect("seed");
    ledger
}

fn seed_total() -> i64 {
    SEED.iter().map(|&(_, b)| b).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_sequential_transfers_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let outcome: Result<(), TestCaseError> = runtime().block_on(async {
            let ledger = seeded_ledger().await;
            let ctx = Context::background();

            for op in &ops {
                match ledger.transfer(&ctx, op.request()).await {
                    Ok(record) => prop_assert_eq!(record.status, TransferStatus::Success),
                    Err(e) => prop_assert!(
                        matches!(e.code(), "INVALID_REQUEST" | "INSUFFICIENT_BALANCE"),
                        "unexpected error {:?}", e
                    ),
                }
            }

            let accounts = ledger.list_accounts(&ctx).await.unwrap();
            let records = ledger.list_transfers(&ctx).await.unwrap();

            // Conservation and non-negativity
            prop_assert_eq!(ledger.total_balance(&ctx).await.unwrap(), seed_total());
            prop_assert!(accounts.iter().all(|a| a.balance >= 0));

            // One record per reference
            let refs: HashSet<_> = records.iter().map(|r| r.reference.clone()).collect();
            prop_assert_eq!(refs.len(), records.len());

            // Replaying the records over the seed yields the live balances
            let mut expected: HashMap<AccountId, i64> = SEED.iter().copied().collect();
            let mut touched: HashMap<AccountId, i64> = HashMap::new();
            for r in &records {
                *expected.entry(r.from_id).or_default() -= r.amount;
                *expected.entry(r.to_id).or_default() += r.amount;
                *touched.entry(r.from_id).or_default() += 1;
                *touched.entry(r.to_id).or_default() += 1;
            }
            for a in &accounts {
                prop_assert_eq!(a.balance, expected[&a.id]);
                prop_assert_eq!(a.version, touched.get(&a.id).copied().unwrap_or(0));
            }
            Ok(())
        });
        outcome?;
    }

    #[test]
    fn prop_batch_continue_on_error_matches_records(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let outcome: Result<(), TestCaseError> = runtime().block_on(async {
            let ledger = seeded_ledger().await;
            let ctx = Context::background();

            let legs: Vec<_> = ops.iter().map(Op::request).collect();
            let report = ledger
                .transfer_batch_with(&ctx, legs, NestedPolicy::ContinueOnError)
                .await
                .unwrap();

            prop_assert_eq!(report.outcomes.len(), ops.len());
            let expected_status = match report.succeeded() {
                0 => TransferStatus::Failed,
                n if n == ops.len() => TransferStatus::Success,
                _ => TransferStatus::Partial,
            };
            prop_assert_eq!(report.status, expected_status);

            // Replayed legs return an existing record, so records <= successes
            let records = ledger.list_transfers(&ctx).await.unwrap();
            prop_assert!(records.len() <= report.succeeded());
            prop_assert_eq!(ledger.total_balance(&ctx).await.unwrap(), seed_total());
            Ok(())
        });
        outcome?;
    }
}

#[test]
fn test_concurrent_mixed_strategies_conserve_total() {
    runtime().block_on(async {
        let ledger = seeded_ledger().await;

        let mut handles = Vec::new();
        for i in 0..60u32 {
            let ledger = ledger.clone();
            let (from, to) = match i % 3 {
                0 => (1, 2),
                1 => (2, 3),
                _ => (3, 1),
            };
            let strategy = if i % 2 == 0 {
                LockStrategy::Pessimistic
            } else {
                LockStrategy::Optimistic
            };
            handles.push(tokio::spawn(async move {
                ledger
                    .transfer(
                        &Context::background(),
                        TransferRequest::new(from, to, 25, format!("MIX-{}", i))
                            .with_strategy(strategy),
                    )
                    .await
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await.unwrap() {
                assert!(
                    e.is_retryable() || e.code() == "INSUFFICIENT_BALANCE",
                    "unexpected error {:?}",
                    e
                );
            }
        }

        let ctx = Context::background();
        assert_eq!(ledger.total_balance(&ctx).await.unwrap(), seed_total());
    });
}
