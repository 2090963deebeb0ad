//! Validator membership, heartbeat liveness and reputation
//!
//! A validator counts toward quorum only while it is:
//! - `ACTIVE`
//! - above the reputation floor
//! - live: `now - last_heartbeat < 3 × heartbeat_interval`
//!
//! [`ValidatorSet`] is the only writer of validator rows. [`LivenessMonitor`] runs
//! [`ValidatorSet::sweep_liveness`] on a timer, off the transaction hot path.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use bridge_common::{compute_heartbeat_hash, ValidatorStatus};

use crate::config::ValidatorPolicy;
use crate::db::{PersistenceStore, ValidatorChange, ValidatorGuard, ValidatorUpdate};
use crate::error::{BridgeError, BridgeResult, ConfigError, IntegrityError, StoreError};
use crate::keys::SignatureVerifier;
use crate::models::{NewValidator, Validator};

pub const MIN_REPUTATION: i32 = 0;
pub const MAX_REPUTATION: i32 = 100;

pub struct ValidatorSet {
    store: Arc<dyn PersistenceStore>,
    verifier: Arc<dyn SignatureVerifier>,
    policy: ValidatorPolicy,
}

impl ValidatorSet {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        verifier: Arc<dyn SignatureVerifier>,
        policy: ValidatorPolicy,
    ) -> Self {
        Self {
            store,
            verifier,
            policy,
        }
    }

    pub fn policy(&self) -> &ValidatorPolicy {
        &self.policy
    }

    pub fn verifier(&self) -> &Arc<dyn SignatureVerifier> {
        &self.verifier
    }

    /// Register a validator for a bridge. Starts `PENDING` until its first heartbeat.
    pub async fn register(
        &self,
        bridge_id: i64,
        address: &str,
        public_key: &str,
    ) -> BridgeResult<Validator> {
        if self.store.get_bridge(bridge_id).await?.is_none() {
            return Err(BridgeError::not_found("bridge", bridge_id));
        }
        let address = address.trim();
        if address.is_empty() {
            return Err(ConfigError::InvalidValidator("address must not be empty".into()).into());
        }
        self.verifier
            .validate_public_key(public_key)
            .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;

        let validator = self
            .store
            .insert_validator(&NewValidator {
                bridge_id,
                address: address.to_string(),
                public_key: public_key.trim().to_string(),
                reputation: self.policy.initial_reputation.clamp(MIN_REPUTATION, MAX_REPUTATION),
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => {
                    BridgeError::Integrity(IntegrityError::AlreadyExists {
                        entity: "validator",
                        key: format!("{}/{}", bridge_id, address),
                    })
                }
                other => other.into(),
            })?;

        info!(
            validator_id = validator.id,
            bridge_id,
            address = %validator.address,
            "Validator registered"
        );
        Ok(validator)
    }

    pub async fn get(&self, validator_id: i64) -> BridgeResult<Validator> {
        self.store
            .get_validator(validator_id)
            .await?
            .ok_or_else(|| BridgeError::not_found("validator", validator_id))
    }

    pub async fn list(&self, bridge_id: i64) -> BridgeResult<Vec<Validator>> {
        Ok(self.store.list_validators(bridge_id).await?)
    }

    /// Apply `update` to the stored row, `NotFound` when the validator does not exist
    async fn apply(&self, validator_id: i64, update: ValidatorUpdate) -> BridgeResult<ValidatorChange> {
        self.store
            .update_validator(validator_id, &update)
            .await?
            .ok_or_else(|| BridgeError::not_found("validator", validator_id))
    }

    pub async fn heartbeat(&self, validator_id: i64) -> BridgeResult<Validator> {
        self.heartbeat_at(validator_id, Utc::now()).await
    }

    /// Record a heartbeat observed at `at`. Promotes `PENDING`/`SUSPENDED` validators
    /// whose reputation is above the floor.
    pub async fn heartbeat_at(&self, validator_id: i64, at: DateTime<Utc>) -> BridgeResult<Validator> {
        let change = self
            .apply(
                validator_id,
                ValidatorUpdate::Heartbeat {
                    at,
                    promote_above: self.policy.reputation_floor,
                },
            )
            .await?;
        if change.previous.status != change.validator.status {
            info!(
                validator_id,
                from = %change.previous.status,
                reputation = change.validator.reputation,
                "Validator promoted to ACTIVE"
            );
        }
        Ok(change.validator)
    }

    /// Heartbeat from outside the process. `signature` is the validator's signature over
    /// [`compute_heartbeat_hash`]`(validator_id, timestamp)`; the timestamp must be within
    /// one heartbeat interval of now and newer than the last one recorded.
    pub async fn signed_heartbeat(
        &self,
        validator_id: i64,
        timestamp: i64,
        signature: &str,
    ) -> BridgeResult<Validator> {
        let validator = self.get(validator_id).await?;
        let stale = || {
            BridgeError::from(IntegrityError::StaleHeartbeat {
                validator_id,
                timestamp,
            })
        };
        let at = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| stale())?;
        let skew = chrono::Duration::from_std(self.policy.heartbeat_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let replayed = validator.last_heartbeat.is_some_and(|last| at <= last);
        if replayed || (Utc::now() - at).abs() > skew {
            return Err(stale());
        }

        self.verifier
            .verify(
                &validator.public_key,
                &compute_heartbeat_hash(validator_id, timestamp),
                signature,
            )
            .map_err(|e| IntegrityError::InvalidSignature {
                validator_id,
                reason: e.to_string(),
            })?;
        self.heartbeat_at(validator_id, at).await
    }

    /// Apply a reputation change, clamped to [0, 100]
    pub async fn adjust_reputation(
        &self,
        validator_id: i64,
        delta: i32,
        reason: &str,
    ) -> BridgeResult<Validator> {
        let change = self
            .apply(
                validator_id,
                ValidatorUpdate::Reputation {
                    delta,
                    min: MIN_REPUTATION,
                    max: MAX_REPUTATION,
                },
            )
            .await?;
        let before = change.previous.reputation;
        let after = change.validator.reputation;
        info!(
            validator_id,
            before,
            after,
            delta,
            reason,
            "Validator reputation adjusted"
        );
        if before > self.policy.reputation_floor && after <= self.policy.reputation_floor {
            warn!(validator_id, reputation = after, "Validator fell to reputation floor");
        }
        Ok(change.validator)
    }

    /// Administrative suspension
    pub async fn suspend(&self, validator_id: i64, reason: &str) -> BridgeResult<Validator> {
        let change = self
            .apply(
                validator_id,
                ValidatorUpdate::Status {
                    status: ValidatorStatus::Suspended,
                    expected: None,
                },
            )
            .await?;
        if change.previous.status != ValidatorStatus::Suspended {
            warn!(validator_id, reason, "Validator suspended");
        }
        Ok(change.validator)
    }

    /// Replace a validator's public key. Attestations already recorded keep counting.
    pub async fn rotate_key(&self, validator_id: i64, public_key: &str) -> BridgeResult<Validator> {
        self.verifier
            .validate_public_key(public_key)
            .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;
        let change = self
            .apply(
                validator_id,
                ValidatorUpdate::PublicKey(public_key.trim().to_string()),
            )
            .await?;
        info!(validator_id, "Validator key rotated");
        Ok(change.validator)
    }

    pub fn is_live(&self, validator: &Validator, now: DateTime<Utc>) -> bool {
        let Some(last) = validator.last_heartbeat else {
            return false;
        };
        let window = chrono::Duration::from_std(self.policy.liveness_window())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        now.signed_duration_since(last) < window
    }

    /// Quorum eligibility at `now`
    pub fn eligible_at(&self, validator: &Validator, now: DateTime<Utc>) -> bool {
        validator.status == ValidatorStatus::Active
            && validator.reputation > self.policy.reputation_floor
            && self.is_live(validator, now)
    }

    /// The quorum-eligible set for a bridge
    pub async fn list_active(&self, bridge_id: i64) -> BridgeResult<Vec<Validator>> {
        self.list_active_at(bridge_id, Utc::now()).await
    }

    pub async fn list_active_at(
        &self,
        bridge_id: i64,
        now: DateTime<Utc>,
    ) -> BridgeResult<Vec<Validator>> {
        Ok(self
            .store
            .list_validators(bridge_id)
            .await?
            .into_iter()
            .filter(|v| self.eligible_at(v, now))
            .collect())
    }

    /// Suspend every `ACTIVE` validator that is no longer live. Returns those suspended.
    ///
    /// A validator whose row changed since the scan (a heartbeat landed) is left alone.
    pub async fn sweep_liveness(&self, now: DateTime<Utc>) -> BridgeResult<Vec<Validator>> {
        let mut suspended = Vec::new();
        for validator in self.store.list_all_validators().await? {
            if validator.status != ValidatorStatus::Active || self.is_live(&validator, now) {
                continue;
            }
            let update = ValidatorUpdate::Status {
                status: ValidatorStatus::Suspended,
                expected: Some(ValidatorGuard::for_validator(&validator)),
            };
            let Some(change) = self.store.update_validator(validator.id, &update).await? else {
                debug!(validator_id = validator.id, "Validator changed during sweep, skipped");
                continue;
            };
            let stored = change.validator;
            warn!(
                validator_id = stored.id,
                bridge_id = stored.bridge_id,
                last_heartbeat = ?stored.last_heartbeat,
                "Validator missed heartbeats, suspended"
            );
            suspended.push(stored);
        }
        Ok(suspended)
    }
}

/// Periodic liveness sweep
pub struct LivenessMonitor {
    validators: Arc<ValidatorSet>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(validators: Arc<ValidatorSet>) -> Self {
        let interval = validators.policy().heartbeat_interval;
        Self {
            validators,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> eyre::Result<()> {
        info!(interval = ?self.interval, "Starting liveness monitor");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Liveness monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.validators.sweep_liveness(Utc::now()).await {
                        Ok(suspended) if !suspended.is_empty() => {
                            info!(count = suspended.len(), "Liveness sweep suspended validators");
                        }
                        Ok(_) => debug!("Liveness sweep: all active validators live"),
                        Err(e) => error!(error = %e, "Liveness sweep failed"),
                    }
                }
            }
        }

        Ok(())
    }
}
