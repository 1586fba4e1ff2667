//! Engine configuration.
//!
//! Every value has a default and can be overridden from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Tunables for the transfer processor and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on waiting for all account locks of one operation.
    pub lock_timeout: Duration,

    /// How long a duplicate submission waits for the first attempt to settle.
    pub idempotency_wait: Duration,

    /// Attempts made on a failing storage call before giving up.
    pub storage_retries: u32,

    /// Base delay between storage attempts; grows linearly.
    pub retry_backoff: Duration,

    /// Ledger entries fetched per page when iterating an account history.
    pub history_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5_000),
            idempotency_wait: Duration::from_millis(5_000),
            storage_retries: 3,
            retry_backoff: Duration::from_millis(10),
            history_page_size: 64,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `LEDGER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lock_timeout = parse_var(&lookup, "LEDGER_LOCK_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let idempotency_wait = parse_var(&lookup, "LEDGER_IDEMPOTENCY_WAIT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.idempotency_wait);

        let storage_retries =
            parse_var(&lookup, "LEDGER_STORAGE_RETRIES")?.unwrap_or(defaults.storage_retries);

        let retry_backoff = parse_var(&lookup, "LEDGER_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let history_page_size =
            parse_var(&lookup, "LEDGER_HISTORY_PAGE_SIZE")?.unwrap_or(defaults.history_page_size);
        if history_page_size == 0 {
            return Err(ConfigError::InvalidValue("LEDGER_HISTORY_PAGE_SIZE"));
        }

        Ok(Self {
            lock_timeout,
            idempotency_wait,
            storage_retries,
            retry_backoff,
            history_page_size,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|raw| raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)))
        .transpose()
}

/// Configuration error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for environment variable {0}")]
    InvalidValue(&'static str),
}
