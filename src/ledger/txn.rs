//! Transaction Coordinator
//!
//! Owns transaction boundaries. A [`Transaction`] is the only handle through
//! which ledger rows are read or written:
//!
//! - every store call races the request [`Context`], so cancellation or an
//!   expired deadline interrupts blocked lock waits
//! - every mutation runs through the registered [`TxInterceptor`]s inside the
//!   same store transaction
//! - nested units of work map to savepoints; see [`NestedPolicy`]
//!
//! Dropping a `Transaction` without `commit` rolls it back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::context::Context;
use super::error::LedgerError;
use super::interceptor::{Mutation, TxInterceptor};
use super::store::{LedgerStore, StoreTx};
use super::types::{
    Account, AccountId, AccountUpdate, AuditEntry, LockMode, NewAccount, NewTransfer,
    TransferId, TransferRecord, TransferStatus, TxOptions,
};

/// Postgres identifier limit
const MAX_SAVEPOINT_NAME_LEN: usize = 63;

/// What a failed nested unit does to the enclosing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedPolicy {
    /// The failure propagates and the outer transaction can only roll back
    #[default]
    FailOuter,
    /// Only the nested unit's writes are undone; the outer transaction goes on
    ContinueOnError,
}

/// Result of a nested unit under [`NestedPolicy::ContinueOnError`]
#[derive(Debug)]
pub enum NestedOutcome<T> {
    Completed(T),
    RolledBack(LedgerError),
}

impl<T> NestedOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, NestedOutcome::Completed(_))
    }
}

#[derive(Clone, Copy)]
enum HookStage {
    Before,
    After,
}

fn finished() -> LedgerError {
    LedgerError::TransactionAborted("transaction already finished".to_string())
}

/// A cancelled context may have abandoned a statement that is still running
/// on the server; stop it before undoing anything.
async fn interrupt_if_cancelled(ctx: &Context, tx: &mut dyn StoreTx) {
    if ctx.check().is_ok() {
        return;
    }
    if let Err(e) = tx.interrupt().await {
        warn!(tx = tx.id(), error = %e, "Interrupt failed");
    }
}

/// Savepoint names reach SQL verbatim, so only plain identifiers pass
fn validate_savepoint_name(name: &str) -> Result<(), LedgerError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_head || !valid_tail || name.len() > MAX_SAVEPOINT_NAME_LEN {
        return Err(LedgerError::InvalidRequest(format!(
            "invalid savepoint name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Opens transactions on a store and wires interceptors into them
#[derive(Clone)]
pub struct TransactionCoordinator {
    store: Arc<dyn LedgerStore>,
    interceptors: Arc<Vec<Arc<dyn TxInterceptor>>>,
    defaults: TxOptions,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            interceptors: Arc::new(Vec::new()),
            defaults: TxOptions::default(),
        }
    }

    /// Register an interceptor; interceptors run in registration order
    pub fn with_interceptor(mut self, interceptor: Arc<dyn TxInterceptor>) -> Self {
        Arc::make_mut(&mut self.interceptors).push(interceptor);
        self
    }

    pub fn with_defaults(mut self, defaults: TxOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> TxOptions {
        self.defaults
    }

    /// Open a transaction. A context deadline also bounds every statement on
    /// the server, so a blocked statement cannot outlive the caller.
    pub async fn begin(&self, ctx: &Context, opts: TxOptions) -> Result<Transaction, LedgerError> {
        let opts = match ctx.deadline() {
            Some(deadline) => opts.with_statement_timeout(
                deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1)),
            ),
            None => opts,
        };
        let inner = ctx.guard(self.store.begin(opts)).await?;
        debug!(
            tx = inner.id(),
            store = self.store.name(),
            isolation = opts.isolation.as_sql(),
            "Transaction begin"
        );

        Ok(Transaction {
            inner: Some(inner),
            ctx: ctx.clone(),
            interceptors: self.interceptors.clone(),
            opts,
            nested_seq: 0,
            rollback_only: None,
        })
    }

    /// Run `f` in a fresh transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// A panic inside `f` drops the transaction, which rolls it back.
    pub async fn run<T, F>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        let mut tx = self.begin(ctx, opts).await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback after failure also failed");
                }
                Err(e)
            }
        }
    }

    /// Run `f` inside `ambient` as a nested unit when present, otherwise in
    /// its own transaction.
    pub async fn nested<T, F>(
        &self,
        ctx: &Context,
        ambient: Option<&mut Transaction>,
        f: F,
    ) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        match ambient {
            Some(tx) => tx.nested(f).await,
            None => self.run(ctx, self.defaults, f).await,
        }
    }
}

/// Open transaction
pub struct Transaction {
    inner: Option<Box<dyn StoreTx>>,
    ctx: Context,
    interceptors: Arc<Vec<Arc<dyn TxInterceptor>>>,
    opts: TxOptions,
    nested_seq: u32,
    /// Set when a nested unit failed under `FailOuter` or an interceptor
    /// rejected a mutation
    rollback_only: Option<String>,
}

impl Transaction {
    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|tx| tx.id())
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn options(&self) -> TxOptions {
        self.opts
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.is_some()
    }

    fn parts(&mut self) -> Result<(&Context, &mut (dyn StoreTx + 'static)), LedgerError> {
        let tx = self.inner.as_deref_mut().ok_or_else(finished)?;
        Ok((&self.ctx, tx))
    }

    async fn run_hooks(
        &mut self,
        stage: HookStage,
        mutation: &Mutation<'_>,
    ) -> Result<(), LedgerError> {
        let interceptors = self.interceptors.clone();
        let (ctx, tx) = self.parts()?;

        let mut rejected = None;
        for interceptor in interceptors.iter() {
            let res = match stage {
                HookStage::Before => ctx.guard(interceptor.before(ctx, &mut *tx, mutation)).await,
                HookStage::After => ctx.guard(interceptor.after(ctx, &mut *tx, mutation)).await,
            };
            if let Err(e) = res {
                debug!(interceptor = interceptor.name(), error = %e, "Interceptor rejected mutation");
                rejected = Some(e);
                break;
            }
        }

        // A vetoed mutation aborts the whole transaction
        match rejected {
            Some(e) => {
                self.rollback_only = Some(e.to_string());
                Err(e)
            }
            None => Ok(()),
        }
    }

    // === accounts ===

    pub async fn fetch_account(
        &mut self,
        id: AccountId,
        lock: LockMode,
    ) -> Result<Option<Account>, LedgerError> {
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.fetch_account(id, lock)).await
    }

    /// Like `fetch_account`, failing with `AccountNotFound`
    pub async fn account(&mut self, id: AccountId, lock: LockMode) -> Result<Account, LedgerError> {
        self.fetch_account(id, lock)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    pub async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError> {
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.list_accounts()).await
    }

    pub async fn create_account(&mut self, account: &NewAccount) -> Result<Account, LedgerError> {
        let mutation = Mutation::CreateAccount(account);
        self.run_hooks(HookStage::Before, &mutation).await?;

        let (ctx, tx) = self.parts()?;
        let created = ctx.guard(tx.insert_account(account)).await?;

        self.run_hooks(HookStage::After, &mutation).await?;
        Ok(created)
    }

    /// Returns rows affected; interceptors see only updates that matched
    pub async fn update_account(&mut self, update: &AccountUpdate) -> Result<u64, LedgerError> {
        let mutation = Mutation::UpdateAccount(update);
        self.run_hooks(HookStage::Before, &mutation).await?;

        let (ctx, tx) = self.parts()?;
        let rows = ctx.guard(tx.update_account(update)).await?;

        if rows > 0 {
            self.run_hooks(HookStage::After, &mutation).await?;
        }
        Ok(rows)
    }

    // === transfer records ===

    pub async fn fetch_transfer(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.fetch_transfer(reference)).await
    }

    pub async fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, LedgerError> {
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.list_transfers()).await
    }

    pub async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
    ) -> Result<TransferRecord, LedgerError> {
        let mutation = Mutation::InsertTransfer(transfer);
        self.run_hooks(HookStage::Before, &mutation).await?;

        let (ctx, tx) = self.parts()?;
        let record = ctx.guard(tx.insert_transfer(transfer)).await?;

        self.run_hooks(HookStage::After, &mutation).await?;
        Ok(record)
    }

    pub async fn set_transfer_status(
        &mut self,
        id: TransferId,
        status: TransferStatus,
        message: &str,
    ) -> Result<TransferRecord, LedgerError> {
        let mutation = Mutation::UpdateTransferStatus {
            id,
            status,
            message,
        };
        self.run_hooks(HookStage::Before, &mutation).await?;

        let (ctx, tx) = self.parts()?;
        let record = ctx
            .guard(tx.update_transfer_status(id, status, message))
            .await?
            .ok_or_else(|| LedgerError::TransferNotFound(id.to_string()))?;

        self.run_hooks(HookStage::After, &mutation).await?;
        Ok(record)
    }

    pub async fn list_audit(&mut self) -> Result<Vec<AuditEntry>, LedgerError> {
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.list_audit()).await
    }

    // === savepoints ===

    pub async fn savepoint(&mut self, name: &str) -> Result<(), LedgerError> {
        validate_savepoint_name(name)?;
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.savepoint(name)).await
    }

    /// Undo every write made since `name`; the savepoint stays usable.
    ///
    /// Row locks taken after the savepoint are kept until the transaction
    /// ends.
    pub async fn rollback_to(&mut self, name: &str) -> Result<(), LedgerError> {
        validate_savepoint_name(name)?;
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.rollback_to(name)).await
    }

    pub async fn release(&mut self, name: &str) -> Result<(), LedgerError> {
        validate_savepoint_name(name)?;
        let (ctx, tx) = self.parts()?;
        ctx.guard(tx.release(name)).await
    }

    /// Nested unit under [`NestedPolicy::FailOuter`]
    pub async fn nested<T, F>(&mut self, f: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        match self.nested_with(NestedPolicy::FailOuter, f).await? {
            NestedOutcome::Completed(value) => Ok(value),
            NestedOutcome::RolledBack(e) => Err(e),
        }
    }

    /// Run `f` behind a savepoint.
    ///
    /// On failure the unit's writes are rolled back to the savepoint. Under
    /// `FailOuter` the error is returned and the transaction becomes
    /// rollback-only; under `ContinueOnError` the error is reported as
    /// [`NestedOutcome::RolledBack`]. Cancellation always propagates.
    pub async fn nested_with<T, F>(
        &mut self,
        policy: NestedPolicy,
        f: F,
    ) -> Result<NestedOutcome<T>, LedgerError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
    {
        if let Some(reason) = &self.rollback_only {
            return Err(LedgerError::TransactionAborted(format!(
                "transaction is rollback-only: {}",
                reason
            )));
        }

        self.nested_seq += 1;
        let name = format!("sp_nested_{}", self.nested_seq);
        self.savepoint(&name).await?;

        let err = match f(&mut *self).await {
            Ok(value) => {
                self.release(&name).await?;
                return Ok(NestedOutcome::Completed(value));
            }
            Err(e) => e,
        };

        // Undo the unit even when the context is already cancelled
        let undo = match self.inner.as_deref_mut() {
            Some(tx) => {
                interrupt_if_cancelled(&self.ctx, &mut *tx).await;
                match tx.rollback_to(&name).await {
                    Ok(()) => tx.release(&name).await,
                    Err(e) => Err(e),
                }
            }
            None => Err(finished()),
        };
        if let Err(undo_err) = undo {
            warn!(savepoint = %name, error = %undo_err, "Nested rollback failed");
            self.rollback_only = Some(undo_err.to_string());
            return Err(err);
        }

        debug!(savepoint = %name, error = %err, policy = ?policy, "Nested unit rolled back");
        match policy {
            NestedPolicy::ContinueOnError if !matches!(err, LedgerError::Cancelled(_)) => {
                // The savepoint undid whatever marked the unit rollback-only
                self.rollback_only = None;
                Ok(NestedOutcome::RolledBack(err))
            }
            _ => {
                self.rollback_only = Some(err.to_string());
                Err(err)
            }
        }
    }

    // === completion ===

    /// Commit, unless the transaction is rollback-only or its context is done,
    /// in which case it is rolled back and the reason returned.
    ///
    /// Once the store commit starts it is not interrupted.
    pub async fn commit(mut self) -> Result<(), LedgerError> {
        let mut inner = self.inner.take().ok_or_else(finished)?;
        let id = inner.id();

        let abort = match self.rollback_only.take() {
            Some(reason) => Some(LedgerError::TransactionAborted(format!(
                "transaction is rollback-only: {}",
                reason
            ))),
            None => self.ctx.check().err(),
        };
        if let Some(err) = abort {
            interrupt_if_cancelled(&self.ctx, &mut *inner).await;
            if let Err(rb) = inner.rollback().await {
                warn!(tx = id, error = %rb, "Rollback failed");
            }
            debug!(tx = id, error = %err, "Transaction rolled back instead of commit");
            return Err(err);
        }

        inner.commit().await?;
        debug!(tx = id, "Transaction committed");
        Ok(())
    }

    /// Roll back; never interrupted by the context
    pub async fn rollback(mut self) -> Result<(), LedgerError> {
        let mut inner = self.inner.take().ok_or_else(finished)?;
        let id = inner.id();
        interrupt_if_cancelled(&self.ctx, &mut *inner).await;
        inner.rollback().await?;
        debug!(tx = id, "Transaction rolled back");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            warn!(tx = inner.id(), "Transaction dropped without commit or rollback");
        }
    }
}
