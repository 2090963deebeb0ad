//! Persistence layer
//!
//! [`PersistenceStore`] is the only way registries and the coordinator touch state. Two
//! implementations ship with the crate: [`MemoryStore`] (tests, single-process dev) and
//! [`PgStore`] (Postgres via sqlx). Both give the same guarantees:
//!
//! - `insert_transaction_if_absent` is atomic on `(bridge_id, source_tx_hash)`
//! - `append_attestation` is atomic on `(transaction_id, validator_id)` and only lands while
//!   the transaction is `PENDING_VALIDATION`
//! - `compare_and_set` applies a patch only when status and execution attempt still match
//!   the caller's snapshot
//! - `update_validator` applies one [`ValidatorUpdate`] against the row as stored, under a
//!   row lock, so concurrent heartbeats and penalties never overwrite each other

use async_trait::async_trait;
use bridge_common::{TransactionStatus, ValidatorStatus};
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    Attestation, Bridge, BridgeTransaction, NewBridge, NewTransaction, NewValidator,
    RejectedAttestation, SupportedToken, Validator,
};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_pool, run_migrations, PgStore};

pub type StoreResult<T> = Result<T, StoreError>;

/// Expected state for a compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionGuard {
    pub status: TransactionStatus,
    pub execution_attempt_id: i64,
}

impl TransitionGuard {
    pub fn for_transaction(tx: &BridgeTransaction) -> Self {
        Self {
            status: tx.status,
            execution_attempt_id: tx.execution_attempt_id,
        }
    }
}

/// Field updates applied by a successful compare-and-set. `None` keeps the stored value.
///
/// Stores bump `updated_at` on every write and `status_changed_at` whenever `status`
/// differs from the stored one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionPatch {
    pub status: Option<TransactionStatus>,
    pub confirmations: Option<i64>,
    pub quorum_threshold: Option<i32>,
    pub validator_roster: Option<Vec<i64>>,
    pub execution_attempt_id: Option<i64>,
    pub execution_retries: Option<i32>,
    pub target_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refund_required: Option<bool>,
}

impl TransactionPatch {
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply to an in-memory record
    pub fn apply(&self, tx: &mut BridgeTransaction, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            if status != tx.status {
                tx.status_changed_at = now;
            }
            tx.status = status;
        }
        if let Some(confirmations) = self.confirmations {
            tx.confirmations = confirmations;
        }
        if let Some(threshold) = self.quorum_threshold {
            tx.quorum_threshold = Some(threshold);
        }
        if let Some(roster) = &self.validator_roster {
            tx.validator_roster = roster.clone();
        }
        if let Some(attempt) = self.execution_attempt_id {
            tx.execution_attempt_id = attempt;
        }
        if let Some(retries) = self.execution_retries {
            tx.execution_retries = retries;
        }
        if let Some(hash) = &self.target_tx_hash {
            tx.target_tx_hash = Some(hash.clone());
        }
        if let Some(message) = &self.error_message {
            tx.error_message = Some(message.clone());
        }
        if let Some(completed_at) = self.completed_at {
            tx.completed_at = Some(completed_at);
        }
        if let Some(refund) = self.refund_required {
            tx.refund_required = refund;
        }
        tx.updated_at = now;
    }
}

/// Result of [`PersistenceStore::append_attestation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// This validator already attested the transaction
    Duplicate,
    /// The transaction has left `PENDING_VALIDATION`
    Closed(TransactionStatus),
}

/// Expected validator state for a guarded status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorGuard {
    pub status: ValidatorStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ValidatorGuard {
    pub fn for_validator(validator: &Validator) -> Self {
        Self {
            status: validator.status,
            last_heartbeat: validator.last_heartbeat,
        }
    }
}

/// A single-field validator change, applied to the stored row under its lock
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatorUpdate {
    /// Set `last_heartbeat`; promote to `ACTIVE` when reputation is above `promote_above`
    Heartbeat {
        at: DateTime<Utc>,
        promote_above: i32,
    },
    /// Add `delta`, clamped to `[min, max]`
    Reputation { delta: i32, min: i32, max: i32 },
    /// Skipped when `expected` no longer matches the row
    Status {
        status: ValidatorStatus,
        expected: Option<ValidatorGuard>,
    },
    PublicKey(String),
}

impl ValidatorUpdate {
    /// Apply to an in-memory record. Returns false, leaving `validator` untouched, when a
    /// status guard does not match.
    pub fn apply(&self, validator: &mut Validator) -> bool {
        match self {
            ValidatorUpdate::Heartbeat { at, promote_above } => {
                validator.last_heartbeat = Some(*at);
                if validator.status != ValidatorStatus::Active
                    && validator.reputation > *promote_above
                {
                    validator.status = ValidatorStatus::Active;
                }
            }
            ValidatorUpdate::Reputation { delta, min, max } => {
                validator.reputation = validator.reputation.saturating_add(*delta).clamp(*min, *max);
            }
            ValidatorUpdate::Status { status, expected } => {
                if let Some(guard) = expected {
                    if *guard != ValidatorGuard::for_validator(validator) {
                        return false;
                    }
                }
                validator.status = *status;
            }
            ValidatorUpdate::PublicKey(key) => validator.public_key = key.clone(),
        }
        true
    }
}

/// The stored row before and after a [`ValidatorUpdate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorChange {
    pub previous: Validator,
    pub validator: Validator,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // Bridges
    async fn insert_bridge(&self, bridge: &NewBridge) -> StoreResult<Bridge>;
    async fn get_bridge(&self, id: i64) -> StoreResult<Option<Bridge>>;
    async fn list_bridges(&self) -> StoreResult<Vec<Bridge>>;
    async fn update_bridge(&self, bridge: &Bridge) -> StoreResult<Bridge>;

    // Validators
    async fn insert_validator(&self, validator: &NewValidator) -> StoreResult<Validator>;
    async fn get_validator(&self, id: i64) -> StoreResult<Option<Validator>>;
    async fn list_validators(&self, bridge_id: i64) -> StoreResult<Vec<Validator>>;
    async fn list_all_validators(&self) -> StoreResult<Vec<Validator>>;
    /// `None` when the validator is missing or a status guard did not match
    async fn update_validator(
        &self,
        id: i64,
        update: &ValidatorUpdate,
    ) -> StoreResult<Option<ValidatorChange>>;

    // Tokens
    async fn insert_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken>;
    async fn get_token(&self, bridge_id: i64, symbol: &str) -> StoreResult<Option<SupportedToken>>;
    async fn list_tokens(&self, bridge_id: i64) -> StoreResult<Vec<SupportedToken>>;
    async fn update_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken>;

    // Transactions

    /// Insert unless `(bridge_id, source_tx_hash)` exists. Returns the stored row and
    /// whether it was created by this call.
    async fn insert_transaction_if_absent(
        &self,
        tx: &NewTransaction,
    ) -> StoreResult<(BridgeTransaction, bool)>;
    async fn get_transaction(&self, id: i64) -> StoreResult<Option<BridgeTransaction>>;
    async fn find_transaction_by_source(
        &self,
        bridge_id: i64,
        source_tx_hash: &str,
    ) -> StoreResult<Option<BridgeTransaction>>;
    /// Returns the updated row, or `None` when the guard no longer matches
    async fn compare_and_set(
        &self,
        id: i64,
        guard: TransitionGuard,
        patch: &TransactionPatch,
    ) -> StoreResult<Option<BridgeTransaction>>;
    /// Oldest first
    async fn list_transactions_by_status(
        &self,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> StoreResult<Vec<BridgeTransaction>>;
    async fn count_transactions_by_status(&self, status: TransactionStatus) -> StoreResult<i64>;

    // Attestations

    /// Append while the transaction is `PENDING_VALIDATION`. Holds off concurrent status
    /// changes to that transaction until the row is written.
    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<AppendOutcome>;
    async fn list_attestations(&self, transaction_id: i64) -> StoreResult<Vec<Attestation>>;
    async fn count_attestations(&self, transaction_id: i64) -> StoreResult<i64>;
    async fn record_rejected_attestation(&self, rejected: &RejectedAttestation)
        -> StoreResult<()>;
    async fn list_rejected_attestations(
        &self,
        transaction_id: i64,
    ) -> StoreResult<Vec<RejectedAttestation>>;

    /// Readiness probe
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
