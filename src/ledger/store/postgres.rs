//! PostgreSQL Ledger Store
//!
//! Each [`StoreTx`] wraps one `sqlx` transaction. Row locks, snapshots and
//! savepoints are the database's own; this module only maps rows and SQLSTATE
//! codes into ledger types.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use super::{LedgerStore, StoreTx};
use crate::ledger::error::{LedgerError, sqlstate};
use crate::ledger::types::{
    Account, AccountId, AccountUpdate, AuditEntry, BalanceChange, LockMode, NewAccount,
    NewTransfer, TransferId, TransferRecord, TransferStatus, TxOptions, VersionGuard,
};

/// Ledger tables. `balance >= 0` is enforced by the database as a backstop.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id          BIGINT PRIMARY KEY,
    name        VARCHAR(128) NOT NULL,
    balance     BIGINT NOT NULL CHECK (balance >= 0),
    version     BIGINT NOT NULL DEFAULT 0,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS transfer_records (
    id          BIGSERIAL PRIMARY KEY,
    reference   VARCHAR(64) NOT NULL UNIQUE,
    from_id     BIGINT NOT NULL,
    to_id       BIGINT NOT NULL,
    amount      BIGINT NOT NULL CHECK (amount > 0),
    status      VARCHAR(16) NOT NULL,
    message     TEXT NOT NULL DEFAULT '',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS ledger_audit (
    id          BIGSERIAL PRIMARY KEY,
    operator    VARCHAR(64) NOT NULL,
    action      VARCHAR(32) NOT NULL,
    entity      VARCHAR(32) NOT NULL,
    entity_id   VARCHAR(64) NOT NULL,
    detail      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const ACCOUNT_COLUMNS: &str = "id, name, balance, version, created_at, updated_at";
const TRANSFER_COLUMNS: &str = "id, reference, from_id, to_id, amount, status, message, created_at";

/// Ledger store backed by a PostgreSQL pool
pub struct PgLedgerStore {
    pool: PgPool,
    next_tx: AtomicU64,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            next_tx: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        tracing::info!("Ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn StoreTx>, LedgerError> {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction
        let mut set_tx = format!("SET TRANSACTION ISOLATION LEVEL {}", opts.isolation.as_sql());
        if opts.read_only {
            set_tx.push_str(" READ ONLY");
        }
        sqlx::query(&set_tx).execute(&mut *tx).await?;

        if let Some(timeout) = opts.lock_timeout {
            let sql = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1));
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        if let Some(timeout) = opts.statement_timeout {
            let sql = format!(
                "SET LOCAL statement_timeout = '{}ms'",
                timeout.as_millis().max(1)
            );
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await?;

        debug!(
            tx = id,
            backend_pid,
            isolation = opts.isolation.as_sql(),
            "Pg tx begin"
        );
        Ok(Box::new(PgTx {
            id,
            tx,
            pool: self.pool.clone(),
            backend_pid,
        }))
    }
}

/// Open PostgreSQL transaction
pub struct PgTx {
    id: u64,
    tx: Transaction<'static, Postgres>,
    /// Used to cancel a statement from another connection
    pool: PgPool,
    backend_pid: i32,
}

fn row_to_account(row: &PgRow) -> Result<Account, LedgerError> {
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        balance: row.try_get("balance")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<TransferRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    let status = TransferStatus::from_str(&status).map_err(LedgerError::TransactionAborted)?;

    Ok(TransferRecord {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        from_id: row.try_get("from_id")?,
        to_id: row.try_get("to_id")?,
        amount: row.try_get("amount")?,
        status,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditEntry, LedgerError> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        operator: row.try_get("operator")?,
        action: row.try_get("action")?,
        entity: row.try_get("entity")?,
        entity_id: row.try_get("entity_id")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == sqlstate::UNIQUE_VIOLATION)
}

impl PgTx {
    async fn execute_plain(&mut self, sql: &str) -> Result<(), LedgerError> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    fn id(&self) -> u64 {
        self.id
    }

    async fn fetch_account(
        &mut self,
        id: AccountId,
        lock: LockMode,
    ) -> Result<Option<Account>, LedgerError> {
        let sql = match lock {
            LockMode::Unlocked => format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
            LockMode::Exclusive => format!(
                "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
                ACCOUNT_COLUMNS
            ),
        };

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn list_accounts(&mut self) -> Result<Vec<Account>, LedgerError> {
        let sql = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<Account, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO accounts (id, name, balance, version, created_at, updated_at)
            VALUES ($1, $2, $3, 0, NOW(), NOW())
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account.id)
            .bind(&account.name)
            .bind(account.balance)
            .fetch_one(&mut *self.tx)
            .await?;
        row_to_account(&row)
    }

    async fn update_account(&mut self, update: &AccountUpdate) -> Result<u64, LedgerError> {
        // Debits and absolute sets are checked against the locked row so that
        // a shortfall surfaces as InsufficientBalance, not a CHECK violation
        if matches!(
            update.balance,
            Some(BalanceChange::Debit(_)) | Some(BalanceChange::Set(_))
        ) {
            let Some(current) = self.fetch_account(update.id, LockMode::Exclusive).await? else {
                return Ok(0);
            };
            if let VersionGuard::Expect(expected) = update.guard
                && current.version != expected
            {
                return Ok(0);
            }
            if let Some(change) = update.balance {
                let next = change.apply(current.balance).ok_or_else(|| {
                    LedgerError::TransactionAborted(format!(
                        "balance of account {} out of range",
                        update.id
                    ))
                })?;
                if next < 0 {
                    return Err(LedgerError::InsufficientBalance {
                        account_id: update.id,
                        available: current.balance,
                        requested: current.balance - next,
                    });
                }
            }
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE accounts SET ");
        {
            let mut set = qb.separated(", ");
            match update.balance {
                Some(BalanceChange::Set(v)) => {
                    set.push("balance = ");
                    set.push_bind_unseparated(v);
                }
                Some(BalanceChange::Debit(v)) => {
                    set.push("balance = balance - ");
                    set.push_bind_unseparated(v);
                }
                Some(BalanceChange::Credit(v)) => {
                    set.push("balance = balance + ");
                    set.push_bind_unseparated(v);
                }
                None => {}
            }
            if let Some(name) = &update.name {
                set.push("name = ");
                set.push_bind_unseparated(name.clone());
            }
            set.push("version = version + 1");
            set.push("updated_at = NOW()");
        }
        qb.push(" WHERE id = ");
        qb.push_bind(update.id);
        if let VersionGuard::Expect(expected) = update.guard {
            qb.push(" AND version = ");
            qb.push_bind(expected);
        }

        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_transfer(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM transfer_records WHERE reference = $1",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(reference)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, LedgerError> {
        let sql = format!("SELECT {} FROM transfer_records ORDER BY id", TRANSFER_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(row_to_transfer).collect()
    }

    async fn insert_transfer(
        &mut self,
        transfer: &NewTransfer,
    ) -> Result<TransferRecord, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO transfer_records (reference, from_id, to_id, amount, status, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&transfer.reference)
            .bind(transfer.from_id)
            .bind(transfer.to_id)
            .bind(transfer.amount)
            .bind(transfer.status.as_str())
            .bind(&transfer.message)
            .fetch_one(&mut *self.tx)
            .await;

        match result {
            Ok(row) => row_to_transfer(&row),
            // The failed statement aborts the transaction; the original row
            // cannot be read back here
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::duplicate(&transfer.reference, None))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_transfer_status(
        &mut self,
        id: TransferId,
        status: TransferStatus,
        message: &str,
    ) -> Result<Option<TransferRecord>, LedgerError> {
        let sql = format!(
            "UPDATE transfer_records SET status = $1, message = $2 WHERE id = $3 RETURNING {}",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(message)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_audit (operator, action, entity, entity_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.operator)
        .bind(&entry.action)
        .bind(&entry.entity)
        .bind(&entry.entity_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_audit(&mut self) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, operator, action, entity, entity_id, detail, created_at FROM ledger_audit ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_audit).collect()
    }

    // Savepoint names are validated by the coordinator before they reach SQL

    async fn savepoint(&mut self, name: &str) -> Result<(), LedgerError> {
        self.execute_plain(&format!("SAVEPOINT {}", name)).await
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), LedgerError> {
        self.execute_plain(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    async fn release(&mut self, name: &str) -> Result<(), LedgerError> {
        self.execute_plain(&format!("RELEASE SAVEPOINT {}", name))
            .await
    }

    async fn interrupt(&mut self) -> Result<(), LedgerError> {
        let signalled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .fetch_one(&self.pool)
            .await?;
        debug!(tx = self.id, backend_pid = self.backend_pid, signalled, "Pg statement interrupted");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let PgTx { id, tx, .. } = *self;
        tx.commit().await?;
        debug!(tx = id, "Pg tx committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        let PgTx { id, tx, .. } = *self;
        tx.rollback().await?;
        debug!(tx = id, "Pg tx rolled back");
        Ok(())
    }
}
