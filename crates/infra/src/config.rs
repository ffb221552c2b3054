//! Application configuration.
//!
//! Loaded from an optional TOML file, then overridden by `KARDEX_`-prefixed
//! environment variables (`__` separates nesting levels, e.g.
//! `KARDEX_SYNC__BATCH_SIZE=100`). Every field has a default, so an empty
//! configuration is valid.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

use kardex_inventory::DocumentRules;

use crate::erp::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Local operational database.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// `None` selects the in-memory store.
    #[serde(default)]
    pub url: Option<Secret<String>>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

/// One ERP database.
#[derive(Debug, Deserialize)]
pub struct ErpConnectionConfig {
    pub url: Secret<String>,
    /// Schema holding `movalmcab` / `movalmdet`.
    #[serde(default = "default_erp_schema")]
    pub schema: String,
    #[serde(default = "default_erp_connections")]
    pub max_connections: u32,
}

fn default_erp_schema() -> String {
    "public".to_string()
}

fn default_erp_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    /// `fixed`, `linear` or `exponential`
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.strategy,
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

/// ERP connections by company alias.
#[derive(Debug, Deserialize)]
pub struct ErpConfig {
    #[serde(default)]
    pub connections: BTreeMap<String, ErpConnectionConfig>,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            connections: BTreeMap::new(),
            read_timeout_secs: default_read_timeout_secs(),
            retry: RetrySettings::default(),
        }
    }
}

impl ErpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

fn default_read_timeout_secs() -> u64 {
    30
}

/// Defaults of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    #[serde(default = "default_reconciliation_days")]
    pub reconciliation_days: u32,
    /// Headers per ERP page and per progress publication.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How far before a reception a matching dispatch may lie.
    #[serde(default = "default_match_window_days")]
    pub reception_match_window_days: u32,
    /// How long a manual reception or reversal waits for a running sync.
    #[serde(default = "default_manual_lock_wait_ms")]
    pub manual_lock_wait_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            start_year: default_start_year(),
            reconciliation_days: default_reconciliation_days(),
            batch_size: default_batch_size(),
            reception_match_window_days: default_match_window_days(),
            manual_lock_wait_ms: default_manual_lock_wait_ms(),
        }
    }
}

impl SyncSettings {
    pub fn match_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reception_match_window_days))
    }

    pub fn manual_lock_wait(&self) -> Duration {
        Duration::from_millis(self.manual_lock_wait_ms)
    }
}

fn default_start_year() -> i32 {
    2000
}

fn default_reconciliation_days() -> u32 {
    15
}

fn default_batch_size() -> usize {
    50
}

fn default_match_window_days() -> u32 {
    30
}

fn default_manual_lock_wait_ms() -> u64 {
    crate::transfers::DEFAULT_LOCK_WAIT.as_millis() as u64
}

/// Job runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Running jobs whose heartbeat is older than this are removed.
    #[serde(default = "default_heartbeat_threshold_secs")]
    pub heartbeat_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            heartbeat_threshold_secs: default_heartbeat_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_job_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_heartbeat_threshold_secs() -> u64 {
    10 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    250
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub erp: ErpConfig,
    #[serde(default)]
    pub rules: DocumentRules,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub jobs: JobSettings,
}

impl AppConfig {
    /// Load from `path` (when given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("KARDEX_").split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batch_size must be positive".into()));
        }
        if self.jobs.workers == 0 {
            return Err(ConfigError::Invalid("jobs.workers must be positive".into()));
        }
        if self.rules.relevant_doc_types.is_empty() {
            return Err(ConfigError::Invalid("rules.relevant_doc_types is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use secrecy::ExposeSecret;

    #[test]
    fn empty_configuration_uses_defaults() {
        let config = AppConfig::from_figment(Figment::new()).unwrap();

        assert!(config.database.url.is_none());
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.manual_lock_wait(), Duration::from_secs(5));
        assert_eq!(config.jobs.job_timeout_secs, 7200);
        assert_eq!(config.erp.read_timeout(), Duration::from_secs(30));
        assert!(config.rules.active_statuses.contains("P"));
    }

    #[test]
    fn file_and_environment_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "kardex.toml",
                r#"
                [sync]
                reconciliation_days = 30

                [erp.connections.acme]
                url = "postgres://erp@localhost/acme"
                schema = "erp"

                [rules]
                relevant_doc_types = ["NI", "GS"]
                "#,
            )?;
            jail.set_env("KARDEX_SYNC__BATCH_SIZE", "10");
            jail.set_env("KARDEX_JOBS__WORKERS", "2");
            jail.set_env("KARDEX_SYNC__MANUAL_LOCK_WAIT_MS", "30000");

            let config = AppConfig::load(Some(Path::new("kardex.toml"))).unwrap();
            assert_eq!(config.sync.reconciliation_days, 30);
            assert_eq!(config.sync.batch_size, 10);
            assert_eq!(config.jobs.workers, 2);
            assert_eq!(config.sync.manual_lock_wait(), Duration::from_secs(30));
            let acme = &config.erp.connections["acme"];
            assert_eq!(acme.url.expose_secret(), "postgres://erp@localhost/acme");
            assert_eq!(acme.schema, "erp");
            assert_eq!(config.rules.relevant_doc_types.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("KARDEX_SYNC__BATCH_SIZE", "0");
            assert!(matches!(AppConfig::load(None), Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn retry_settings_build_a_policy() {
        let policy = RetrySettings::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn retry_strategy_is_configurable() {
        Jail::expect_with(|jail| {
            jail.set_env("KARDEX_ERP__RETRY__STRATEGY", "linear");
            jail.set_env("KARDEX_ERP__RETRY__BASE_DELAY_MS", "200");
            let policy = AppConfig::load(None).unwrap().erp.retry.policy();
            assert_eq!(policy.strategy, BackoffStrategy::Linear);
            assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
            Ok(())
        });
    }
}
