//! Transfer Orchestrator
//!
//! Composes the coordinator, the idempotency guard and concurrency control
//! into the ledger's public operations. Every transfer runs in one
//! transaction:
//!
//! ```text
//! validate → begin → reserve reference → acquire accounts (ascending id)
//!          → check balance → debit + credit → record SUCCESS → commit
//! ```
//!
//! Any failure after `begin` rolls the whole transaction back, so balances and
//! the reference reservation change together or not at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::concurrency::{acquire_pair, apply_transfer};
use super::context::Context;
use super::error::LedgerError;
use super::idempotency::{Reservation, check_and_reserve};
use super::state::{TransferAttempt, TransferPhase};
use super::txn::{NestedOutcome, NestedPolicy, Transaction, TransactionCoordinator};
use super::types::{
    Account, AccountId, Amount, IsolationLevel, LockMode, LockStrategy, MAX_REFERENCE_LEN,
    NewAccount, TransferRecord, TransferRequest, TransferStatus, TxOptions,
};
use crate::config::LedgerConfig;

/// Message stored on a completed transfer record
pub const SUCCESS_MESSAGE: &str = "transfer completed";

/// Answer to a reference that was already used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Return the original record; nothing is mutated
    #[default]
    ReturnExisting,
    /// Fail with `DuplicateReference` carrying the original record
    Reject,
}

/// Orchestrator tuning, usually built from [`LedgerConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSettings {
    pub isolation: IsolationLevel,
    pub lock_timeout: Option<Duration>,
    pub default_strategy: LockStrategy,
    pub on_duplicate: DuplicatePolicy,
    pub nested_policy: NestedPolicy,
}

impl LedgerSettings {
    pub fn tx_options(&self) -> TxOptions {
        TxOptions {
            isolation: self.isolation,
            lock_timeout: self.lock_timeout,
            statement_timeout: None,
            read_only: false,
        }
    }
}

impl From<&LedgerConfig> for LedgerSettings {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            isolation: config.isolation,
            lock_timeout: config.lock_timeout_ms.map(Duration::from_millis),
            default_strategy: config.default_strategy,
            on_duplicate: config.on_duplicate,
            nested_policy: config.nested_policy,
        }
    }
}

/// Outcome of one transfer leg
#[derive(Debug, Clone)]
pub struct LegResult {
    pub reference: String,
    pub result: Result<TransferRecord, LedgerError>,
}

/// Result of [`TransferOrchestrator::transfer_batch`]
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// `SUCCESS` when every leg committed, `PARTIAL` when some did, `FAILED`
    /// when none did
    pub status: TransferStatus,
    pub outcomes: Vec<LegResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// What a leg did inside its transaction
enum LegOutcome {
    Applied(TransferRecord),
    /// Reference already recorded; nothing written
    Replayed(TransferRecord),
}

fn validate(req: &TransferRequest) -> Result<(), LedgerError> {
    if req.amount <= 0 {
        return Err(LedgerError::InvalidRequest(format!(
            "amount must be positive, got {}",
            req.amount
        )));
    }
    if req.from == req.to {
        return Err(LedgerError::InvalidRequest(format!(
            "source and destination are the same account {}",
            req.from
        )));
    }
    if req.reference.is_empty() || req.reference.chars().count() > MAX_REFERENCE_LEN {
        return Err(LedgerError::InvalidRequest(format!(
            "reference must be 1 to {} characters",
            MAX_REFERENCE_LEN
        )));
    }
    Ok(())
}

/// Steps 3 to 7 of a transfer inside an open transaction
async fn execute_leg(
    tx: &mut Transaction,
    req: &TransferRequest,
    strategy: LockStrategy,
    on_duplicate: DuplicatePolicy,
    attempt: &mut TransferAttempt,
) -> Result<LegOutcome, LedgerError> {
    let reserved = match check_and_reserve(tx, &req.reference, req.from, req.to, req.amount).await? {
        Reservation::Fresh(record) => record,
        Reservation::Existing(record) => {
            if !record.matches(req.from, req.to, req.amount) {
                warn!(
                    reference = %req.reference,
                    transfer_id = record.id,
                    "Reference reused with different transfer parameters"
                );
            }
            return match on_duplicate {
                DuplicatePolicy::ReturnExisting => Ok(LegOutcome::Replayed(record)),
                DuplicatePolicy::Reject => Err(LedgerError::duplicate(&req.reference, Some(record))),
            };
        }
    };

    attempt.advance(TransferPhase::Locking)?;
    let pair = acquire_pair(tx, strategy, req.from, req.to).await?;
    if pair.source.balance < req.amount {
        return Err(LedgerError::InsufficientBalance {
            account_id: pair.source.id,
            available: pair.source.balance,
            requested: req.amount,
        });
    }

    attempt.advance(TransferPhase::Mutating)?;
    apply_transfer(tx, strategy, &pair, req.amount).await?;

    attempt.advance(TransferPhase::Recording)?;
    let record = tx
        .set_transfer_status(reserved.id, TransferStatus::Success, SUCCESS_MESSAGE)
        .await?;
    Ok(LegOutcome::Applied(record))
}

/// Validate and run one leg, tracking its phases
async fn run_leg(
    tx: &mut Transaction,
    req: &TransferRequest,
    strategy: LockStrategy,
    on_duplicate: DuplicatePolicy,
    attempt: &mut TransferAttempt,
) -> Result<LegOutcome, LedgerError> {
    attempt.advance(TransferPhase::Validating)?;
    validate(req)?;
    execute_leg(tx, req, strategy, on_duplicate, attempt).await
}

async fn abandon(tx: Transaction) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

/// Ledger operations
#[derive(Clone)]
pub struct TransferOrchestrator {
    coordinator: TransactionCoordinator,
    settings: LedgerSettings,
}

impl TransferOrchestrator {
    pub fn new(coordinator: TransactionCoordinator, settings: LedgerSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn settings(&self) -> LedgerSettings {
        self.settings
    }

    /// Move `req.amount` from `req.from` to `req.to` exactly once per
    /// reference.
    pub async fn transfer(
        &self,
        ctx: &Context,
        req: TransferRequest,
    ) -> Result<TransferRecord, LedgerError> {
        let strategy = req.strategy.unwrap_or(self.settings.default_strategy);
        let mut attempt = TransferAttempt::new(&req.reference);

        // Validation failures never open a transaction
        attempt.advance(TransferPhase::Validating)?;
        if let Err(e) = validate(&req) {
            attempt.abort();
            debug!(reference = %req.reference, error = %e, "Transfer rejected");
            return Err(e);
        }

        let mut tx = match self.coordinator.begin(ctx, self.settings.tx_options()).await {
            Ok(tx) => tx,
            Err(e) => {
                let phase = attempt.abort();
                warn!(reference = %req.reference, code = e.code(), phase = %phase, "Transfer aborted");
                return Err(e);
            }
        };

        let outcome = execute_leg(
            &mut tx,
            &req,
            strategy,
            self.settings.on_duplicate,
            &mut attempt,
        )
        .await;

        let (record, replayed) = match outcome {
            Ok(LegOutcome::Applied(record)) => (record, false),
            Ok(LegOutcome::Replayed(record)) => (record, true),
            Err(e) => {
                let phase = attempt.abort();
                abandon(tx).await;
                warn!(
                    reference = %req.reference,
                    code = e.code(),
                    phase = %phase,
                    strategy = %strategy,
                    error = %e,
                    "Transfer aborted"
                );
                return Err(e);
            }
        };

        if let Err(e) = tx.commit().await {
            let phase = attempt.abort();
            warn!(reference = %req.reference, code = e.code(), phase = %phase, "Transfer commit failed");
            return Err(e);
        }
        attempt.advance(TransferPhase::Committed)?;

        if replayed {
            info!(
                reference = %record.reference,
                transfer_id = record.id,
                status = %record.status,
                "Transfer replayed"
            );
        } else {
            info!(
                reference = %record.reference,
                transfer_id = record.id,
                from = record.from_id,
                to = record.to_id,
                amount = record.amount,
                strategy = %strategy,
                "Transfer committed"
            );
        }
        Ok(record)
    }

    /// [`transfer_batch_with`](Self::transfer_batch_with) under the
    /// configured nested policy
    pub async fn transfer_batch(
        &self,
        ctx: &Context,
        legs: Vec<TransferRequest>,
    ) -> Result<BatchReport, LedgerError> {
        self.transfer_batch_with(ctx, legs, self.settings.nested_policy)
            .await
    }

    /// Run several transfers in one transaction, each leg behind its own
    /// savepoint.
    ///
    /// Under `FailOuter` the first failing leg aborts the batch and its error
    /// is returned. Under `ContinueOnError` failing legs are undone one by one
    /// and reported in the [`BatchReport`].
    ///
    /// Only applied legs leave transfer records, each `SUCCESS`. The batch
    /// status lives in the report: a failed leg's reference stays unused so
    /// the leg can be retried, and no summary row enters the transfer journal.
    pub async fn transfer_batch_with(
        &self,
        ctx: &Context,
        legs: Vec<TransferRequest>,
        policy: NestedPolicy,
    ) -> Result<BatchReport, LedgerError> {
        if legs.is_empty() {
            return Err(LedgerError::InvalidRequest("empty batch".to_string()));
        }

        let mut tx = self
            .coordinator
            .begin(ctx, self.settings.tx_options())
            .await?;
        let mut outcomes = Vec::with_capacity(legs.len());

        for leg in legs {
            let reference = leg.reference.clone();
            let strategy = leg.strategy.unwrap_or(self.settings.default_strategy);
            let on_duplicate = self.settings.on_duplicate;

            let nested = tx
                .nested_with(policy, move |tx| {
                    Box::pin(async move {
                        let mut attempt = TransferAttempt::new(&leg.reference);
                        match run_leg(tx, &leg, strategy, on_duplicate, &mut attempt).await {
                            Ok(LegOutcome::Applied(record)) | Ok(LegOutcome::Replayed(record)) => {
                                Ok(record)
                            }
                            Err(e) => {
                                let phase = attempt.abort();
                                debug!(reference = %leg.reference, phase = %phase, error = %e, "Batch leg failed");
                                Err(e)
                            }
                        }
                    })
                })
                .await;

            match nested {
                Ok(NestedOutcome::Completed(record)) => outcomes.push(LegResult {
                    reference,
                    result: Ok(record),
                }),
                Ok(NestedOutcome::RolledBack(e)) => outcomes.push(LegResult {
                    reference,
                    result: Err(e),
                }),
                Err(e) => {
                    abandon(tx).await;
                    warn!(reference = %reference, code = e.code(), "Batch aborted");
                    return Err(e);
                }
            }
        }

        tx.commit().await?;

        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let status = if succeeded == outcomes.len() {
            TransferStatus::Success
        } else if succeeded == 0 {
            TransferStatus::Failed
        } else {
            TransferStatus::Partial
        };
        info!(
            legs = outcomes.len(),
            succeeded,
            status = %status,
            policy = ?policy,
            "Batch committed"
        );
        Ok(BatchReport { status, outcomes })
    }

    pub async fn get_account(&self, ctx: &Context, id: AccountId) -> Result<Account, LedgerError> {
        let mut tx = self.coordinator.begin(ctx, TxOptions::read_only()).await?;
        let res = tx.account(id, LockMode::Unlocked).await;
        abandon(tx).await;
        res
    }

    pub async fn get_transfer(
        &self,
        ctx: &Context,
        reference: &str,
    ) -> Result<TransferRecord, LedgerError> {
        let mut tx = self.coordinator.begin(ctx, TxOptions::read_only()).await?;
        let res = tx.fetch_transfer(reference).await;
        abandon(tx).await;
        res?.ok_or_else(|| LedgerError::TransferNotFound(reference.to_string()))
    }

    /// Create the given accounts, skipping ids that already exist.
    ///
    /// Returns the accounts actually created.
    pub async fn seed(
        &self,
        ctx: &Context,
        accounts: &[NewAccount],
    ) -> Result<Vec<Account>, LedgerError> {
        let mut tx = self.coordinator.begin(ctx, TxOptions::default()).await?;
        let mut created = Vec::new();

        for account in accounts {
            let res = match tx.fetch_account(account.id, LockMode::Unlocked).await {
                Ok(Some(_)) => {
                    debug!(account_id = account.id, "Seed account exists, skipping");
                    continue;
                }
                Ok(None) => tx.create_account(account).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(row) => created.push(row),
                Err(e) => {
                    abandon(tx).await;
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        info!(created = created.len(), requested = accounts.len(), "Accounts seeded");
        Ok(created)
    }

    pub async fn list_accounts(&self, ctx: &Context) -> Result<Vec<Account>, LedgerError> {
        let mut tx = self.coordinator.begin(ctx, TxOptions::read_only()).await?;
        let res = tx.list_accounts().await;
        abandon(tx).await;
        res
    }

    pub async fn list_transfers(&self, ctx: &Context) -> Result<Vec<TransferRecord>, LedgerError> {
        let mut tx = self.coordinator.begin(ctx, TxOptions::read_only()).await?;
        let res = tx.list_transfers().await;
        abandon(tx).await;
        res
    }

    /// Sum of all balances
    pub async fn total_balance(&self, ctx: &Context) -> Result<Amount, LedgerError> {
        self.list_accounts(ctx)
            .await?
            .iter()
            .try_fold(0 as Amount, |sum, a| sum.checked_add(a.balance))
            .ok_or_else(|| LedgerError::TransactionAborted("total balance overflow".to_string()))
    }
}
