//! Target-chain execution
//!
//! The coordinator never talks to a chain itself. It hands an [`ExecutionRequest`] carrying
//! the collected attestations to a [`TargetExecutor`], which either settles synchronously,
//! accepts for later (the result is reported back by a watcher), or refuses.

use async_trait::async_trait;
use bridge_common::ChainId;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::TransientError;
use crate::models::{ExecutionRequest, SubmitOutcome};
use crate::retry::{classify_error, ErrorClass};

#[async_trait]
pub trait TargetExecutor: Send + Sync {
    /// `Err` means the submission may be retried; `Ok(Rejected)` never should be
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome, TransientError>;
}

/// Relay error body
#[derive(Debug, Deserialize)]
struct RelayError {
    #[serde(default)]
    error: String,
}

/// Forwards execution requests to a relay service per target network
pub struct RelayExecutor {
    client: Client,
    relays: HashMap<ChainId, String>,
}

impl RelayExecutor {
    pub fn new(relays: HashMap<ChainId, String>, call_timeout: Duration) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to create HTTP client: {}", e))?;

        for (network, url) in &relays {
            info!(network = %network, url = %url, "Registered target relay");
        }
        Ok(Self { client, relays })
    }

    fn url_for(&self, network: ChainId) -> Option<String> {
        self.relays
            .get(&network)
            .map(|base| format!("{}/execute", base.trim_end_matches('/')))
    }
}

/// Map a non-success relay response onto a submit result
fn outcome_for_failure(status: StatusCode, message: String) -> Result<SubmitOutcome, TransientError> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransientError::Remote(format!("{} - {}", status, message)));
    }
    match classify_error(&message) {
        ErrorClass::Transient => Err(TransientError::Remote(message)),
        ErrorClass::Permanent | ErrorClass::Unknown => Ok(SubmitOutcome::Rejected {
            reason: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        }),
    }
}

#[async_trait]
impl TargetExecutor for RelayExecutor {
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome, TransientError> {
        let Some(url) = self.url_for(request.target_network) else {
            // Misconfiguration is fixable by an operator, so keep retrying until the
            // execution deadline rather than refunding
            return Err(TransientError::Remote(format!(
                "no relay configured for network {}",
                request.target_network
            )));
        };

        debug!(
            tx_id = request.transaction_id,
            attempt_id = request.attempt_id,
            url = %url,
            "Submitting execution to relay"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransientError::Network(format!("relay timeout: {}", e))
                } else {
                    TransientError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SubmitOutcome>()
                .await
                .map_err(|e| TransientError::Remote(format!("unreadable relay response: {}", e)));
        }

        let message = response
            .json::<RelayError>()
            .await
            .map(|body| body.error)
            .unwrap_or_default();
        warn!(
            tx_id = request.transaction_id,
            status = %status,
            error = %message,
            "Relay refused execution"
        );
        outcome_for_failure(status, message)
    }
}
