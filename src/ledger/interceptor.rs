//! Transaction Interceptors
//!
//! Hooks that run inside the same store transaction as the mutation they
//! observe. A hook error aborts the mutation, and any row a hook writes commits
//! or rolls back together with it.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use super::context::Context;
use super::error::LedgerError;
use super::store::StoreTx;
use super::types::{AccountUpdate, AuditEntry, NewAccount, NewTransfer, TransferId, TransferStatus};
use crate::logging::LEDGER_TRACE_TARGET;

/// A row mutation about to be (or just) applied
#[derive(Debug, Clone, Copy)]
pub enum Mutation<'a> {
    CreateAccount(&'a NewAccount),
    UpdateAccount(&'a AccountUpdate),
    InsertTransfer(&'a NewTransfer),
    UpdateTransferStatus {
        id: TransferId,
        status: TransferStatus,
        message: &'a str,
    },
}

impl Mutation<'_> {
    pub fn action(&self) -> &'static str {
        match self {
            Mutation::CreateAccount(_) | Mutation::InsertTransfer(_) => "create",
            Mutation::UpdateAccount(_) | Mutation::UpdateTransferStatus { .. } => "update",
        }
    }

    /// Table the mutation touches
    pub fn entity(&self) -> &'static str {
        match self {
            Mutation::CreateAccount(_) | Mutation::UpdateAccount(_) => "accounts",
            Mutation::InsertTransfer(_) | Mutation::UpdateTransferStatus { .. } => {
                "transfer_records"
            }
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Mutation::CreateAccount(a) => a.id.to_string(),
            Mutation::UpdateAccount(u) => u.id.to_string(),
            Mutation::InsertTransfer(t) => t.reference.clone(),
            Mutation::UpdateTransferStatus { id, .. } => id.to_string(),
        }
    }

    /// JSON description of the change
    pub fn detail(&self) -> serde_json::Value {
        match self {
            Mutation::CreateAccount(a) => json!({ "name": a.name, "balance": a.balance }),
            Mutation::UpdateAccount(u) => json!({
                "guard": u.guard,
                "balance": u.balance,
                "name": u.name,
            }),
            Mutation::InsertTransfer(t) => json!(t),
            Mutation::UpdateTransferStatus { status, message, .. } => {
                json!({ "status": status, "message": message })
            }
        }
    }
}

/// Hook around every row mutation of a transaction
#[async_trait]
pub trait TxInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the mutation; an error prevents it
    async fn before(
        &self,
        _ctx: &Context,
        _tx: &mut dyn StoreTx,
        _mutation: &Mutation<'_>,
    ) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Runs after the mutation succeeded
    async fn after(
        &self,
        _ctx: &Context,
        _tx: &mut dyn StoreTx,
        _mutation: &Mutation<'_>,
    ) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Writes one audit row per mutation, attributed to the context's operator
#[derive(Debug, Default)]
pub struct AuditInterceptor;

#[async_trait]
impl TxInterceptor for AuditInterceptor {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn after(
        &self,
        ctx: &Context,
        tx: &mut dyn StoreTx,
        mutation: &Mutation<'_>,
    ) -> Result<(), LedgerError> {
        let entry = AuditEntry {
            id: 0,
            operator: ctx.operator().to_string(),
            action: mutation.action().to_string(),
            entity: mutation.entity().to_string(),
            entity_id: mutation.entity_id(),
            detail: mutation.detail().to_string(),
            created_at: Utc::now(),
        };
        tx.insert_audit(&entry).await
    }
}

/// Emits a trace event per mutation on the `LEDGER_TRACE` target
#[derive(Debug, Default)]
pub struct TracingInterceptor;

#[async_trait]
impl TxInterceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn before(
        &self,
        ctx: &Context,
        tx: &mut dyn StoreTx,
        mutation: &Mutation<'_>,
    ) -> Result<(), LedgerError> {
        debug!(
            target: LEDGER_TRACE_TARGET,
            tx = tx.id(),
            operator = ctx.operator(),
            action = mutation.action(),
            entity = mutation.entity(),
            entity_id = %mutation.entity_id(),
            "mutation"
        );
        Ok(())
    }
}
