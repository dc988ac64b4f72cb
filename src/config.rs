use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::Amount;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Chain that emits `Locked` and executes `release`
    pub source: ChainConfig,
    /// Chain that emits `Burned` and executes `mint`
    pub destination: ChainConfig,
    pub relay: RelayConfig,
    pub api: ApiConfig,
    pub log_format: LogFormat,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// One side of the bridge
#[derive(Clone)]
pub struct ChainConfig {
    /// Stable name used in idempotency keys and cursors; must never change
    /// once events have been recorded
    pub key: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    /// Operator key; without it the chain can be observed but not written
    pub private_key: Option<String>,
    pub confirmation_depth: u64,
    /// First block to scan when no cursor is stored
    pub start_block: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("key", &self.key)
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("confirmation_depth", &self.confirmation_depth)
            .field("start_block", &self.start_block)
            .finish()
    }
}

/// Relay pipeline tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub worker_concurrency: usize,
    pub batch_size: i64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub rpc_timeout_ms: u64,
    pub inclusion_timeout_ms: u64,
    /// Upper bound on one Action Executor call
    pub executor_timeout_ms: u64,
    /// Age after which a `Submitting` event is handed to reconciliation
    pub submitting_timeout_secs: u64,
    pub reconcile_interval_ms: u64,
    pub max_block_range: u64,
    /// Empty means every asset is accepted
    pub supported_assets: Vec<String>,
    pub max_relay_amount: Option<Amount>,
}

impl RelayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.retry_base_delay_ms),
            max_backoff: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_millis(self.inclusion_timeout_ms)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }

    pub fn submitting_timeout(&self) -> Duration {
        Duration::from_secs(self.submitting_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

/// HTTP status / operator API
#[derive(Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bearer token for dead-letter actions; those routes answer 403 when unset
    pub admin_token: Option<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Default functions
fn default_max_connections() -> u32 {
    10
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_batch_size() -> i64 {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    2000
}

fn default_retry_max_delay() -> u64 {
    300_000
}

fn default_rpc_timeout() -> u64 {
    15_000
}

fn default_inclusion_timeout() -> u64 {
    90_000
}

fn default_executor_timeout() -> u64 {
    150_000
}

fn default_submitting_timeout() -> u64 {
    600
}

fn default_reconcile_interval() -> u64 {
    30_000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_api_port() -> u16 {
    9090
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .wrap_err_with(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

impl ChainConfig {
    /// Load one chain from `{prefix}_*` variables
    fn from_env(prefix: &str, default_key: &str) -> Result<Self> {
        let var = |suffix: &str| format!("{}_{}", prefix, suffix);
        Ok(Self {
            key: optional(&var("CHAIN_KEY")).unwrap_or_else(|| default_key.to_string()),
            rpc_url: required(&var("RPC_URL"))?,
            chain_id: required(&var("CHAIN_ID"))?
                .parse()
                .wrap_err_with(|| format!("{} must be a valid u64", var("CHAIN_ID")))?,
            bridge_address: required(&var("BRIDGE_ADDRESS"))?,
            private_key: optional(&var("PRIVATE_KEY")),
            confirmation_depth: parsed_or(
                &var("CONFIRMATION_DEPTH"),
                default_confirmation_depth(),
            )?,
            start_block: parsed_or(&var("START_BLOCK"), 0)?,
        })
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.key.is_empty() || self.key.contains(':') {
            return Err(eyre!("{}.key must be non-empty and must not contain ':'", label));
        }
        if self.rpc_url.is_empty() {
            return Err(eyre!("{}.rpc_url cannot be empty", label));
        }
        if self.bridge_address.len() != 42 || !self.bridge_address.starts_with("0x") {
            return Err(eyre!(
                "{}.bridge_address must be a valid hex address (42 chars with 0x prefix)",
                label
            ));
        }
        if let Some(key) = &self.private_key {
            if key.len() != 66 || !key.starts_with("0x") {
                return Err(eyre!(
                    "{}.private_key must be 66 chars (0x + 64 hex chars)",
                    label
                ));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
            max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", default_max_connections())?,
        };

        let source = ChainConfig::from_env("SOURCE", "source")?;
        let destination = ChainConfig::from_env("DEST", "destination")?;

        let supported_assets = optional("SUPPORTED_ASSETS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let max_relay_amount = optional("MAX_RELAY_AMOUNT")
            .map(|raw| {
                raw.parse::<Amount>()
                    .wrap_err("MAX_RELAY_AMOUNT must be a base-10 integer")
            })
            .transpose()?;

        let relay = RelayConfig {
            poll_interval_ms: parsed_or("POLL_INTERVAL_MS", default_poll_interval())?,
            worker_concurrency: parsed_or("WORKER_CONCURRENCY", default_worker_concurrency())?,
            batch_size: parsed_or("BATCH_SIZE", default_batch_size())?,
            max_attempts: parsed_or("MAX_ATTEMPTS", default_max_attempts())?,
            retry_base_delay_ms: parsed_or("RETRY_BASE_DELAY_MS", default_retry_base_delay())?,
            retry_max_delay_ms: parsed_or("RETRY_MAX_DELAY_MS", default_retry_max_delay())?,
            rpc_timeout_ms: parsed_or("RPC_TIMEOUT_MS", default_rpc_timeout())?,
            inclusion_timeout_ms: parsed_or("INCLUSION_TIMEOUT_MS", default_inclusion_timeout())?,
            executor_timeout_ms: parsed_or("EXECUTOR_TIMEOUT_MS", default_executor_timeout())?,
            submitting_timeout_secs: parsed_or(
                "SUBMITTING_TIMEOUT_SECS",
                default_submitting_timeout(),
            )?,
            reconcile_interval_ms: parsed_or(
                "RECONCILE_INTERVAL_MS",
                default_reconcile_interval(),
            )?,
            max_block_range: parsed_or("MAX_BLOCK_RANGE", default_max_block_range())?,
            supported_assets,
            max_relay_amount,
        };

        let api = ApiConfig {
            bind_address: optional("API_BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed_or("API_PORT", default_api_port())?,
            admin_token: optional("API_ADMIN_TOKEN"),
        };

        let log_format = match optional("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let config = Config {
            database,
            source,
            destination,
            relay,
            api,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        self.source.validate("source")?;
        self.destination.validate("destination")?;

        // Both chains share the key namespace and the cursor table
        if self.source.key == self.destination.key {
            return Err(eyre!(
                "source and destination chain keys must differ (both are {:?})",
                self.source.key
            ));
        }

        let relay = &self.relay;
        if relay.worker_concurrency == 0 {
            return Err(eyre!("relay.worker_concurrency must be at least 1"));
        }
        if relay.batch_size <= 0 {
            return Err(eyre!("relay.batch_size must be positive"));
        }
        if relay.max_block_range == 0 {
            return Err(eyre!("relay.max_block_range must be at least 1"));
        }
        if relay.retry_max_delay_ms < relay.retry_base_delay_ms {
            return Err(eyre!(
                "relay.retry_max_delay_ms cannot be below relay.retry_base_delay_ms"
            ));
        }
        // One submit is a processedKeys read and a send before the inclusion
        // wait; the executor must not give up while the tx hash is in hand.
        let submit_budget = relay
            .inclusion_timeout_ms
            .saturating_add(relay.rpc_timeout_ms.saturating_mul(2));
        if relay.executor_timeout_ms <= submit_budget {
            return Err(eyre!(
                "relay.executor_timeout_ms ({}ms) must exceed relay.inclusion_timeout_ms + 2 x relay.rpc_timeout_ms ({}ms)",
                relay.executor_timeout_ms,
                submit_budget
            ));
        }

        // A Submitting event younger than one executor call may still have a
        // live worker behind it; reconciling it would race that worker.
        if relay.submitting_timeout() <= relay.executor_timeout() {
            return Err(eyre!(
                "relay.submitting_timeout_secs ({}s) must exceed relay.executor_timeout_ms ({}ms)",
                relay.submitting_timeout_secs,
                relay.executor_timeout_ms
            ));
        }

        Ok(())
    }
}
