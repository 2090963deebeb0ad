//! Background transaction processor
//!
//! Polls the store for transactions the coordinator can move forward on its own:
//! - `SOURCE_CONFIRMED` → request validation (retried each poll until the roster is big
//!   enough or the validation window expires)
//! - `PENDING_VALIDATION` with a quorum already recorded → `VALIDATED`
//! - `VALIDATED` → execute on the target chain
//!
//! and then fails closed every transaction whose wait has exceeded its deadline.
//! Transactions within one poll are handled concurrently; the status CAS keeps them safe
//! against API calls touching the same rows.

use bridge_common::TransactionStatus;
use chrono::Utc;
use eyre::{eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::coordinator::TransactionCoordinator;
use crate::error::{BridgeError, TransientError};
use crate::metrics;
use crate::registry::BridgeRegistry;
use crate::retry::{classify_error, RetryConfig};
use crate::validators::ValidatorSet;

/// Circuit breaker configuration for the poll loop
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub validation_requested: usize,
    pub validated: usize,
    pub executed: usize,
    pub timed_out: usize,
}

/// Processor health status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub consecutive_failures: u32,
}

pub struct TransactionProcessor {
    coordinator: Arc<TransactionCoordinator>,
    bridges: Arc<BridgeRegistry>,
    validators: Arc<ValidatorSet>,
    config: ProcessorConfig,
    retry_config: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    consecutive_failures: u32,
}

/// Store failures abort the poll; everything else is a per-transaction outcome
fn is_infrastructure_error(e: &BridgeError) -> bool {
    matches!(e, BridgeError::Store(_))
}

impl TransactionProcessor {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        bridges: Arc<BridgeRegistry>,
        validators: Arc<ValidatorSet>,
        config: ProcessorConfig,
    ) -> Self {
        let retry_config = coordinator.settings().retry.clone();
        Self {
            coordinator,
            bridges,
            validators,
            config,
            retry_config,
            circuit_breaker: CircuitBreakerConfig::default(),
            consecutive_failures: 0,
        }
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut cycle_count = 0u64;

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Transaction processor starting poll loop"
        );

        loop {
            cycle_count += 1;

            // Roughly once a minute at the default interval
            if cycle_count % 12 == 1 {
                info!(
                    cycle = cycle_count,
                    consecutive_failures = self.consecutive_failures,
                    "Transaction processor heartbeat"
                );
            }

            tokio::select! {
                _ = self.poll_with_breaker() => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping transaction processor");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping transaction processor");
                    return Ok(());
                }
            }
        }
    }

    async fn poll_with_breaker(&mut self) {
        if self.consecutive_failures >= self.circuit_breaker.threshold {
            warn!(
                failures = self.consecutive_failures,
                pause_secs = self.circuit_breaker.pause_duration.as_secs(),
                "Processor circuit breaker tripped, pausing"
            );
            tokio::time::sleep(self.circuit_breaker.pause_duration).await;
            self.consecutive_failures = 0;
        }

        match self.process_pending().await {
            Ok(summary) => {
                self.consecutive_failures = 0;
                metrics::record_successful_poll();
                if summary != PollSummary::default() {
                    debug!(?summary, "Processor poll complete");
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let error_class = classify_error(&e.to_string());
                let backoff = self
                    .retry_config
                    .backoff_for_attempt(self.consecutive_failures);
                error!(
                    error = %e,
                    ?error_class,
                    consecutive_failures = self.consecutive_failures,
                    next_backoff_secs = backoff.as_secs(),
                    "Error processing transactions, will retry with backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
        metrics::set_consecutive_failures(self.consecutive_failures);
    }

    /// One pass over actionable transactions
    pub async fn process_pending(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();

        let confirmed = self
            .coordinator
            .list_by_status(&[TransactionStatus::SourceConfirmed], self.config.batch_size)
            .await?;
        let results = join_all(
            confirmed
                .iter()
                .map(|tx| self.coordinator.request_validation(tx.id)),
        )
        .await;
        for (tx, result) in confirmed.iter().zip(results) {
            match result {
                Ok(_) => summary.validation_requested += 1,
                Err(BridgeError::Transient(TransientError::InsufficientValidators {
                    eligible,
                    threshold,
                })) => {
                    debug!(tx_id = tx.id, eligible, threshold, "Waiting for enough validators");
                }
                Err(e) if is_infrastructure_error(&e) => return Err(eyre!(e)),
                Err(e) => warn!(tx_id = tx.id, error = %e, "Validation request failed"),
            }
        }

        summary.validated = self.coordinator.reconcile_quorum().await?.len();

        let validated = self
            .coordinator
            .list_by_status(&[TransactionStatus::Validated], self.config.batch_size)
            .await?;
        let results = join_all(
            validated
                .iter()
                .map(|tx| self.coordinator.execute_target(tx.id)),
        )
        .await;
        for (tx, result) in validated.iter().zip(results) {
            match result {
                Ok(_) => summary.executed += 1,
                Err(e) if is_infrastructure_error(&e) => return Err(eyre!(e)),
                Err(e) => warn!(tx_id = tx.id, error = %e, "Target execution failed"),
            }
        }

        summary.timed_out = self.coordinator.sweep_timeouts(Utc::now()).await?.len();

        self.update_gauges().await?;
        Ok(summary)
    }

    async fn update_gauges(&self) -> Result<()> {
        for status in TransactionStatus::ALL {
            if status.is_terminal() {
                continue;
            }
            let count = self.coordinator.count_by_status(status).await?;
            metrics::set_pending_transactions(status.as_str(), count);
        }
        for bridge in self.bridges.list().await? {
            let active = self.validators.list_active(bridge.id).await?;
            metrics::set_active_validators(bridge.id, active.len());
        }
        Ok(())
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            healthy: self.consecutive_failures < self.circuit_breaker.threshold,
            consecutive_failures: self.consecutive_failures,
        }
    }
}
