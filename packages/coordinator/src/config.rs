//! Coordinator configuration
//!
//! Policy structs ([`ValidatorPolicy`], [`TimeoutPolicy`], [`RetryConfig`]) are plain values
//! that the library components take at construction. [`Config::load`] builds them, plus the
//! binary's server and transport settings, from environment variables (optionally from a
//! `.env` file).

use bridge_common::{ChainId, Redacted};
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Liveness and reputation rules for validators
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorPolicy {
    pub heartbeat_interval: Duration,
    /// Validators at or below this reputation never count toward quorum
    pub reputation_floor: i32,
    pub initial_reputation: i32,
    /// Subtracted for each attestation whose signature fails to verify
    pub invalid_signature_penalty: i32,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(default_heartbeat_interval_secs()),
            reputation_floor: default_reputation_floor(),
            initial_reputation: default_initial_reputation(),
            invalid_signature_penalty: default_invalid_signature_penalty(),
        }
    }
}

impl ValidatorPolicy {
    /// A validator is live while its last heartbeat is younger than this
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Deadlines after which a transaction fails closed
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    pub confirmation_timeout: Duration,
    pub validation_window: Duration,
    pub execution_timeout: Duration,
    /// Per-call bound for validator broadcasts and target submissions
    pub external_call_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(default_confirmation_timeout_secs()),
            validation_window: Duration::from_secs(default_validation_window_secs()),
            execution_timeout: Duration::from_secs(default_execution_timeout_secs()),
            external_call_timeout: Duration::from_millis(default_external_call_timeout_ms()),
        }
    }
}

/// Everything the library components need
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorSettings {
    pub validators: ValidatorPolicy,
    pub timeouts: TimeoutPolicy,
    pub retry: RetryConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &Redacted(&self.url))
            .finish()
    }
}

/// HTTP API configuration
#[derive(Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bearer token for `/v1/admin/*`. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
}

/// Custom Debug that redacts the admin token.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("admin_token", &self.admin_token.as_ref().map(Redacted))
            .finish()
    }
}

/// Background processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
}

/// Outbound endpoints
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Relay URL per target network
    pub target_relays: HashMap<ChainId, String>,
    /// Webhook URL per validator address
    pub validator_endpoints: HashMap<String, String>,
}

/// Main configuration for the coordinator binary
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs against the in-memory store
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub processor: ProcessorConfig,
    pub settings: CoordinatorSettings,
    pub transport: TransportConfig,
    pub json_logs: bool,
}

/// Default functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9092
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_batch_size() -> i64 {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_reputation_floor() -> i32 {
    20
}

fn default_initial_reputation() -> i32 {
    50
}

fn default_invalid_signature_penalty() -> i32 {
    10
}

fn default_confirmation_timeout_secs() -> u64 {
    3600
}

fn default_validation_window_secs() -> u64 {
    600
}

fn default_execution_timeout_secs() -> u64 {
    1800
}

fn default_external_call_timeout_ms() -> u64 {
    10_000
}

/// Read an optional variable, failing on values that do not parse
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .wrap_err_with(|| format!("{} has an invalid value '{}'", name, raw)),
        _ => Ok(None),
    }
}

/// Parse `key=url,key=url` lists
pub fn parse_endpoint_map(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (key, url) = entry
                .split_once('=')
                .ok_or_else(|| eyre!("expected key=url, got '{}'", entry))?;
            let (key, url) = (key.trim(), url.trim());
            if key.is_empty() || url.is_empty() {
                return Err(eyre!("empty key or url in '{}'", entry));
            }
            Ok((key.to_string(), url.to_string()))
        })
        .collect()
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
    pub fn load_from_env() -> Result<Self> {
        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig { url });

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: env_parse("API_PORT")?.unwrap_or(default_api_port()),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
        };

        let processor = ProcessorConfig {
            poll_interval_ms: env_parse("POLL_INTERVAL_MS")?.unwrap_or(default_poll_interval()),
            batch_size: env_parse("PROCESSOR_BATCH_SIZE")?.unwrap_or(default_batch_size()),
        };

        let validators = ValidatorPolicy {
            heartbeat_interval: Duration::from_secs(
                env_parse("HEARTBEAT_INTERVAL_SECS")?
                    .unwrap_or(default_heartbeat_interval_secs()),
            ),
            reputation_floor: env_parse("REPUTATION_FLOOR")?
                .unwrap_or(default_reputation_floor()),
            initial_reputation: env_parse("INITIAL_REPUTATION")?
                .unwrap_or(default_initial_reputation()),
            invalid_signature_penalty: env_parse("INVALID_SIGNATURE_PENALTY")?
                .unwrap_or(default_invalid_signature_penalty()),
        };

        let timeouts = TimeoutPolicy {
            confirmation_timeout: Duration::from_secs(
                env_parse("CONFIRMATION_TIMEOUT_SECS")?
                    .unwrap_or(default_confirmation_timeout_secs()),
            ),
            validation_window: Duration::from_secs(
                env_parse("VALIDATION_WINDOW_SECS")?
                    .unwrap_or(default_validation_window_secs()),
            ),
            execution_timeout: Duration::from_secs(
                env_parse("EXECUTION_TIMEOUT_SECS")?
                    .unwrap_or(default_execution_timeout_secs()),
            ),
            external_call_timeout: Duration::from_millis(
                env_parse("EXTERNAL_CALL_TIMEOUT_MS")?
                    .unwrap_or(default_external_call_timeout_ms()),
            ),
        };

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: env_parse("RETRY_ATTEMPTS")?.unwrap_or(defaults.max_retries),
            initial_backoff: env_parse("RETRY_INITIAL_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: env_parse("RETRY_MAX_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            backoff_multiplier: defaults.backoff_multiplier,
        };

        let mut transport = TransportConfig::default();
        if let Ok(raw) = env::var("TARGET_RELAY_URLS") {
            for (chain, url) in parse_endpoint_map(&raw).wrap_err("Invalid TARGET_RELAY_URLS")? {
                let chain_id = ChainId::from_str(&chain)
                    .wrap_err_with(|| format!("Invalid chain id '{}' in TARGET_RELAY_URLS", chain))?;
                transport.target_relays.insert(chain_id, url);
            }
        }
        if let Ok(raw) = env::var("VALIDATOR_ENDPOINTS") {
            transport.validator_endpoints = parse_endpoint_map(&raw)
                .wrap_err("Invalid VALIDATOR_ENDPOINTS")?
                .into_iter()
                .collect();
        }

        let json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = Config {
            database,
            api,
            processor,
            settings: CoordinatorSettings {
                validators,
                timeouts,
                retry,
            },
            transport,
            json_logs,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            if !db.url.starts_with("postgres://") && !db.url.starts_with("postgresql://") {
                return Err(eyre!("DATABASE_URL must be a postgres:// URL"));
            }
        }

        if let Some(token) = &self.api.admin_token {
            if token.len() < 16 {
                return Err(eyre!("ADMIN_TOKEN must be at least 16 characters"));
            }
        }

        if self.processor.poll_interval_ms == 0 {
            return Err(eyre!("POLL_INTERVAL_MS must be greater than 0"));
        }

        let v = &self.settings.validators;
        if v.heartbeat_interval.is_zero() {
            return Err(eyre!("HEARTBEAT_INTERVAL_SECS must be greater than 0"));
        }
        for (name, value) in [
            ("REPUTATION_FLOOR", v.reputation_floor),
            ("INITIAL_REPUTATION", v.initial_reputation),
            ("INVALID_SIGNATURE_PENALTY", v.invalid_signature_penalty),
        ] {
            if !(0..=100).contains(&value) {
                return Err(eyre!("{} must be within [0, 100], got {}", name, value));
            }
        }

        let t = &self.settings.timeouts;
        if t.confirmation_timeout.is_zero()
            || t.validation_window.is_zero()
            || t.execution_timeout.is_zero()
            || t.external_call_timeout.is_zero()
        {
            return Err(eyre!("timeouts must be greater than 0"));
        }

        let r = &self.settings.retry;
        if r.initial_backoff > r.max_backoff {
            return Err(eyre!(
                "RETRY_INITIAL_BACKOFF_MS cannot exceed RETRY_MAX_BACKOFF_MS"
            ));
        }

        for url in self
            .transport
            .target_relays
            .values()
            .chain(self.transport.validator_endpoints.values())
        {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(eyre!("endpoint '{}' must be an http(s) URL", url));
            }
        }

        Ok(())
    }
}
