use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::ledger::orchestrator::DuplicatePolicy;
use crate::ledger::txn::NestedPolicy;
use crate::ledger::types::{IsolationLevel, LockStrategy, NewAccount, TransferRequest};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit per-mutation events on the `LEDGER_TRACE` target
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Accounts created at startup; existing ids are left alone
    #[serde(default)]
    pub seed: Vec<NewAccount>,
    /// Transfers executed by the demo binary after seeding
    #[serde(default)]
    pub transfers: Vec<TransferRequest>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required when `backend` is `postgres`
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            postgres_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Transfer engine behaviour
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    #[serde(default)]
    pub isolation: IsolationLevel,
    /// Row-lock wait bound; absent means wait until granted
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub default_strategy: LockStrategy,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
    /// Policy for batch legs
    #[serde(default)]
    pub nested_policy: NestedPolicy,
}

fn default_lock_timeout_ms() -> Option<u64> {
    Some(5000)
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            default_strategy: LockStrategy::default(),
            on_duplicate: DuplicatePolicy::default(),
            nested_policy: NestedPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.store.backend == StoreBackend::Postgres && self.store.postgres_url.is_none() {
            anyhow::bail!("store.postgres_url is required for the postgres backend");
        }
        if let Some(bad) = self.seed.iter().find(|a| a.balance < 0) {
            anyhow::bail!("seed account {} has a negative balance", bad.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        assert!(!config.enable_tracing);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.max_connections, 20);
        assert_eq!(config.ledger, LedgerConfig::default());
        assert_eq!(config.ledger.lock_timeout_ms, Some(5000));
        assert!(config.seed.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
store:
  backend: postgres
  postgres_url: postgres://localhost/ledger
ledger:
  isolation: repeatable_read
  lock_timeout_ms: 250
  default_strategy: optimistic
  on_duplicate: reject
  nested_policy: continue_on_error
seed:
  - { id: 1, name: Alice Corp, balance: 100000 }
  - { id: 2, name: Bob Studio, balance: 30000 }
transfers:
  - { from: 1, to: 2, amount: 5000, reference: TX-001 }
  - { from: 2, to: 1, amount: 10, reference: TX-002, strategy: optimistic }
"#
        );
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.ledger.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(config.ledger.nested_policy, NestedPolicy::ContinueOnError);
        assert_eq!(config.seed[1], NewAccount::new(2, "Bob Studio", 30_000));
        assert_eq!(config.transfers[0].strategy, None);
        assert_eq!(config.transfers[1].strategy, Some(LockStrategy::Optimistic));
    }

    #[test]
    fn test_shipped_dev_config() {
        let config = AppConfig::load("dev").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.seed[0], NewAccount::new(1, "Alice Corp", 100_000));
        assert_eq!(config.transfers[0].reference, "TX-001");
    }

    #[test]
    fn test_postgres_requires_url() {
        let yaml = format!("{}store:\n  backend: postgres\n", MINIMAL);
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_negative_seed_rejected() {
        let yaml = format!("{}seed:\n  - {{ id: 1, name: x, balance: -1 }}\n", MINIMAL);
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }
}
