//! Atomic Ledger - demo runner
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│  Store   │───▶│ Orchestrator │───▶│ Balances │
//! │  (YAML)  │    │(mem / pg)│    │ (transfers)  │    │  (log)   │
//! └──────────┘    └──────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! Seeds the configured accounts, runs the configured transfers and prints the
//! resulting balances.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;

use atomic_ledger::config::{AppConfig, StoreBackend};
use atomic_ledger::db::Database;
use atomic_ledger::ledger::{
    AuditInterceptor, Context, LedgerSettings, LedgerStore, MemoryStore, PgLedgerStore,
    TracingInterceptor, TransactionCoordinator, TransferOrchestrator,
};

const GIT_HASH: &str = env!("GIT_HASH");

/// `--env <name>` / `-e <name>`, then `LEDGER_ENV`, then `dev`
fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    std::env::var("LEDGER_ENV").unwrap_or_else(|_| "dev".to_string())
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Postgres => {
            let url = config
                .store
                .postgres_url
                .as_deref()
                .context("store.postgres_url is not set")?;
            let db = Database::connect_with(url, &config.store)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check failed")?;

            let store = PgLedgerStore::new(db.pool().clone());
            store.migrate().await?;

            let (accounts, transfers) = db.ledger_row_counts().await?;
            tracing::info!(accounts, transfers, "Existing ledger rows");
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = atomic_ledger::logging::init_logging(&app_config);

    tracing::info!(git = GIT_HASH, "Starting Atomic Ledger in {} mode", env);

    let store = build_store(&app_config).await?;
    let coordinator = TransactionCoordinator::new(store.clone())
        .with_interceptor(Arc::new(TracingInterceptor))
        .with_interceptor(Arc::new(AuditInterceptor));
    let settings = LedgerSettings::from(&app_config.ledger);
    let orchestrator = TransferOrchestrator::new(coordinator, settings);

    println!("=== Atomic Ledger ({}) ===", GIT_HASH);
    println!(
        "Store: {}  strategy: {}  isolation: {}",
        store.name(),
        settings.default_strategy,
        settings.isolation.as_sql()
    );

    let ctx = Context::background().with_operator("bootstrap");
    let created = orchestrator.seed(&ctx, &app_config.seed).await?;
    println!("Seeded {} account(s)", created.len());

    let total_before = orchestrator.total_balance(&ctx).await?;
    let start = Instant::now();
    let mut committed = 0usize;

    for req in app_config.transfers.iter().cloned() {
        let reference = req.reference.clone();
        match orchestrator.transfer(&ctx, req).await {
            Ok(record) => {
                committed += 1;
                println!(
                    "  {} {} -> {} amount={} status={}",
                    record.reference, record.from_id, record.to_id, record.amount, record.status
                );
            }
            Err(e) => println!("  {} FAILED [{}] {}", reference, e.code(), e),
        }
    }

    let elapsed = start.elapsed();
    println!(
        "\n{} of {} transfer(s) committed in {:.2?}",
        committed,
        app_config.transfers.len(),
        elapsed
    );

    println!("\nBalances:");
    for account in orchestrator.list_accounts(&ctx).await? {
        println!(
            "  #{:<4} {:<16} {:>12}  (v{})",
            account.id, account.name, account.balance, account.version
        );
    }

    let total_after = orchestrator.total_balance(&ctx).await?;
    if total_before != total_after {
        anyhow::bail!(
            "balance total changed from {} to {}",
            total_before,
            total_after
        );
    }
    tracing::info!(total = total_after, committed, "Run complete");
    Ok(())
}
