//! Attestation request delivery
//!
//! After a transaction enters `PENDING_VALIDATION` the coordinator hands the canonical
//! payload to an [`AttestationTransport`]. Delivery is best effort: validators that miss a
//! broadcast can still pull `GET /v1/validators/{id}/requests`, and the validation window
//! bounds how long the transaction waits either way.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use bridge_common::bytes32_from_hex;

use crate::coordinator::TransactionCoordinator;
use crate::error::{SignatureError, TransientError};
use crate::keys::KeyManager;
use crate::models::{AttestationRequest, Validator};
use crate::retry::{with_retry, with_timeout, RetryConfig};

#[async_trait]
pub trait AttestationTransport: Send + Sync {
    /// Deliver `request` to each validator in `validators` (the snapshot roster)
    async fn broadcast(
        &self,
        request: &AttestationRequest,
        validators: &[Validator],
    ) -> Result<(), TransientError>;
}

/// Drops every request. Validators poll for work instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

#[async_trait]
impl AttestationTransport for NoopTransport {
    async fn broadcast(
        &self,
        request: &AttestationRequest,
        validators: &[Validator],
    ) -> Result<(), TransientError> {
        debug!(
            tx_id = request.transaction_id,
            roster = validators.len(),
            "No attestation transport configured, validators must poll"
        );
        Ok(())
    }
}

// ============================================================================
// In-process validators
// ============================================================================

/// Signature produced by an in-process validator, waiting to be submitted
#[derive(Debug, Clone, PartialEq)]
pub struct SignedAttestation {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
}

/// Validators whose signing keys live in this process (dev networks and tests)
///
/// Signatures go out on a channel rather than straight into the coordinator, since the
/// coordinator owns this transport. [`forward_local_attestations`] closes the loop.
pub struct LocalValidatorPool {
    signers: RwLock<HashMap<i64, KeyManager>>,
    outbox: mpsc::UnboundedSender<SignedAttestation>,
}

impl LocalValidatorPool {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignedAttestation>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (
            Self {
                signers: RwLock::new(HashMap::new()),
                outbox,
            },
            inbox,
        )
    }

    /// Attach a key to a registered validator id. Returns its public key.
    pub async fn insert(&self, validator_id: i64, keys: KeyManager) -> Result<String, SignatureError> {
        let public_key = keys.public_key_hex()?;
        self.signers.write().await.insert(validator_id, keys);
        Ok(public_key)
    }

    /// Rotate the validator's key, returning the new public key to register
    pub async fn rotate(&self, validator_id: i64) -> Result<String, SignatureError> {
        let mut signers = self.signers.write().await;
        let keys = signers
            .get_mut(&validator_id)
            .ok_or(SignatureError::KeyUnavailable)?;
        keys.rotate()
    }

    /// Drop the validator's key
    pub async fn remove(&self, validator_id: i64) {
        if let Some(mut keys) = self.signers.write().await.remove(&validator_id) {
            keys.teardown();
        }
    }

    pub async fn sign(&self, validator_id: i64, payload_hash: &[u8; 32]) -> Result<String, SignatureError> {
        let signers = self.signers.read().await;
        signers
            .get(&validator_id)
            .ok_or(SignatureError::KeyUnavailable)?
            .sign(payload_hash)
    }
}

#[async_trait]
impl AttestationTransport for LocalValidatorPool {
    async fn broadcast(
        &self,
        request: &AttestationRequest,
        validators: &[Validator],
    ) -> Result<(), TransientError> {
        let payload_hash = bytes32_from_hex(&request.payload_hash)
            .map_err(|e| TransientError::Remote(format!("payload hash: {}", e)))?;

        let signers = self.signers.read().await;
        let mut signed = 0usize;
        for validator in validators {
            let Some(keys) = signers.get(&validator.id) else {
                continue;
            };
            match keys.sign(&payload_hash) {
                Ok(signature) => {
                    let attestation = SignedAttestation {
                        transaction_id: request.transaction_id,
                        validator_id: validator.id,
                        signature,
                    };
                    if self.outbox.send(attestation).is_err() {
                        return Err(TransientError::Network(
                            "local attestation channel closed".into(),
                        ));
                    }
                    signed += 1;
                }
                Err(e) => warn!(validator_id = validator.id, error = %e, "Local signer failed"),
            }
        }

        debug!(tx_id = request.transaction_id, signed, "Local validators signed payload");
        Ok(())
    }
}

/// Submit signatures from a [`LocalValidatorPool`] until shutdown or channel close
pub async fn forward_local_attestations(
    coordinator: Arc<TransactionCoordinator>,
    mut inbox: mpsc::UnboundedReceiver<SignedAttestation>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting local attestation forwarder");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Local attestation forwarder shutting down");
                break;
            }
            next = inbox.recv() => {
                let Some(attestation) = next else {
                    break;
                };
                if let Err(e) = coordinator
                    .submit_attestation(
                        attestation.transaction_id,
                        attestation.validator_id,
                        &attestation.signature,
                    )
                    .await
                {
                    warn!(
                        tx_id = attestation.transaction_id,
                        validator_id = attestation.validator_id,
                        error = %e,
                        "Local attestation not accepted"
                    );
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Webhooks
// ============================================================================

/// POSTs the request JSON to each validator's configured endpoint
pub struct WebhookTransport {
    client: Client,
    /// Validator address → URL
    endpoints: HashMap<String, String>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl WebhookTransport {
    pub fn new(
        endpoints: HashMap<String, String>,
        retry: RetryConfig,
        call_timeout: Duration,
    ) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoints,
            retry,
            call_timeout,
        })
    }

    async fn post_once(&self, url: &str, request: &AttestationRequest) -> Result<(), TransientError> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransientError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransientError::Remote(format!("{} - {}", status, body)))
    }

    async fn deliver(&self, url: &str, request: &AttestationRequest) -> Result<(), TransientError> {
        with_retry(&self.retry, |_| {
            with_timeout(self.call_timeout, self.post_once(url, request))
        })
        .await
    }
}

#[async_trait]
impl AttestationTransport for WebhookTransport {
    async fn broadcast(
        &self,
        request: &AttestationRequest,
        validators: &[Validator],
    ) -> Result<(), TransientError> {
        let targets: Vec<(&Validator, &String)> = validators
            .iter()
            .filter_map(|v| self.endpoints.get(&v.address).map(|url| (v, url)))
            .collect();

        if targets.is_empty() {
            debug!(tx_id = request.transaction_id, "No validator endpoints in roster");
            return Ok(());
        }

        let results = join_all(
            targets
                .iter()
                .map(|(_, url)| self.deliver(url.as_str(), request)),
        )
        .await;

        let mut failures = 0usize;
        for ((validator, _), result) in targets.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                error!(
                    tx_id = request.transaction_id,
                    validator_id = validator.id,
                    error = %e,
                    "Attestation request delivery failed"
                );
            }
        }

        if failures == targets.len() {
            return Err(TransientError::Network(format!(
                "all {} validator webhooks failed",
                failures
            )));
        }
        Ok(())
    }
}
