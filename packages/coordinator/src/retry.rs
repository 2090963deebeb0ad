//! Retry and timeout utilities for external calls
//!
//! Provides exponential backoff, error classification for relay responses, and a
//! timeout wrapper so that no call to a validator or target relay can hang a transaction.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransientError;

/// Retry configuration for target execution and outbound webhooks
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies relay errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Target refused the transfer - do not retry
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error message reported by a relay or watcher
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("underpriced")
        || error_lower.contains("nonce too")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient liquidity")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("recipient blocked")
        || error_lower.contains("already executed")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Run an external call under a deadline
pub async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> Result<T, TransientError>
where
    Fut: Future<Output = Result<T, TransientError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransientError::Timeout(limit.as_millis() as u64)),
    }
}

/// Execute with retry logic. `operation` receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, TransientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransientError>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !config.should_retry(attempt) {
                    warn!(attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                let backoff = config.backoff_for_attempt(attempt);
                attempt += 1;
                debug!(
                    attempt,
                    max = config.max_retries,
                    ?backoff,
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
