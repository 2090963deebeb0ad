//! Transaction coordinator
//!
//! Drives a bridge transaction through its lifecycle:
//!
//! ```text
//! INITIATED -> PENDING_SOURCE_CONFIRMATION -> SOURCE_CONFIRMED -> PENDING_VALIDATION
//!   -> VALIDATED -> PENDING_TARGET_EXECUTION -> COMPLETED
//! ```
//!
//! with `FAILED` and `REVERTED` as the other terminal states.
//!
//! Every status change goes through one private `transition` helper, which checks the
//! transition table and then performs a compare-and-set on `(status, execution_attempt_id)`.
//! That CAS is the only synchronisation between concurrent callers: whoever loses reloads
//! and gets [`BridgeError::Conflict`] with the state the winner left behind.
//!
//! Outcomes that end a transaction (timeouts, retry exhaustion, target rejection) are written
//! onto the transaction. Callers that already had their deposit accepted never see them as
//! errors; they read them back through the status queries.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use bridge_common::{
    bytes32_from_hex, bytes32_to_hex, compute_payload_hash, rescale, PayloadFields,
    TransactionStatus,
};

use crate::audit::{AuditSink, SettlementSink, TracingAuditSink, TracingSettlementSink};
use crate::config::CoordinatorSettings;
use crate::db::{AppendOutcome, PersistenceStore, TransactionPatch, TransitionGuard};
use crate::error::{
    BridgeError, BridgeResult, ConfigError, ExecutionError, IntegrityError, QuorumError,
    StoreError, TransientError,
};
use crate::executor::TargetExecutor;
use crate::metrics;
use crate::models::{
    Attestation, AttestationRequest, BridgeTransaction, Deposit, ExecutionOutcome,
    ExecutionRequest, NewTransaction, RefundObligation, RejectedAttestation, SubmitOutcome,
    TransitionEvent,
};
use crate::registry::BridgeRegistry;
use crate::retry::with_timeout;
use crate::tokens::{normalize_symbol, TokenRegistry};
use crate::transport::{AttestationTransport, NoopTransport};
use crate::validators::ValidatorSet;

const REASON_CONFIRMATION_TIMEOUT: &str = "confirmation_timeout";
const REASON_EXECUTION_TIMEOUT: &str = "execution_timeout";
const REASON_INVALID_SIGNATURE: &str = "invalid_signature";

/// Upper bound on rows examined per status query
const SCAN_LIMIT: i64 = 1000;

/// Result of [`TransactionCoordinator::submit_attestation`]
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationOutcome {
    pub transaction: BridgeTransaction,
    /// False when this validator had already attested
    pub accepted: bool,
    pub attestation_count: i64,
}

/// Result of an execution step. `refund` is set when the transfer was reverted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub transaction: BridgeTransaction,
    pub refund: Option<RefundObligation>,
}

impl ExecutionResult {
    fn unchanged(transaction: BridgeTransaction) -> Self {
        Self {
            transaction,
            refund: None,
        }
    }
}

pub struct TransactionCoordinator {
    store: Arc<dyn PersistenceStore>,
    bridges: Arc<BridgeRegistry>,
    validators: Arc<ValidatorSet>,
    tokens: Arc<TokenRegistry>,
    executor: Arc<dyn TargetExecutor>,
    transport: Arc<dyn AttestationTransport>,
    audit: Arc<dyn AuditSink>,
    settlement: Arc<dyn SettlementSink>,
    settings: CoordinatorSettings,
}

impl TransactionCoordinator {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        bridges: Arc<BridgeRegistry>,
        validators: Arc<ValidatorSet>,
        tokens: Arc<TokenRegistry>,
        executor: Arc<dyn TargetExecutor>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            bridges,
            validators,
            tokens,
            executor,
            transport: Arc::new(NoopTransport),
            audit: Arc::new(TracingAuditSink),
            settlement: Arc::new(TracingSettlementSink),
            settings,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn AttestationTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_settlement(mut self, settlement: Arc<dyn SettlementSink>) -> Self {
        self.settlement = settlement;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    // ========================================================================
    // Transition helper
    // ========================================================================

    async fn load(&self, id: i64) -> BridgeResult<BridgeTransaction> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| BridgeError::not_found("transaction", id))
    }

    /// Apply `patch` if `tx` is still what the store holds. A patch without a status
    /// only updates fields; it still goes through the CAS.
    async fn transition(
        &self,
        tx: &BridgeTransaction,
        patch: TransactionPatch,
        reason: Option<&str>,
    ) -> BridgeResult<BridgeTransaction> {
        if tx.status.is_terminal() {
            return Err(BridgeError::TerminalState {
                id: tx.id,
                status: tx.status,
            });
        }
        if let Some(next) = patch.status {
            if next != tx.status && !tx.status.can_transition_to(next) {
                return Err(BridgeError::InvalidTransition {
                    from: tx.status,
                    to: next,
                });
            }
        }

        let guard = TransitionGuard::for_transaction(tx);
        let Some(updated) = self.store.compare_and_set(tx.id, guard, &patch).await? else {
            let current = self.load(tx.id).await?;
            debug!(
                tx_id = tx.id,
                expected = %tx.status,
                current = %current.status,
                "Lost transition race"
            );
            return Err(BridgeError::Conflict {
                id: tx.id,
                current: current.status,
            });
        };

        if updated.status != tx.status {
            self.audit
                .record_transition(&TransitionEvent {
                    transaction_id: updated.id,
                    bridge_id: updated.bridge_id,
                    from: tx.status,
                    to: updated.status,
                    reason: reason.map(str::to_string),
                    at: updated.status_changed_at,
                })
                .await;
        }
        Ok(updated)
    }

    /// Resolve a lost race into the winner's state
    async fn settle_conflict(
        &self,
        result: BridgeResult<BridgeTransaction>,
    ) -> BridgeResult<BridgeTransaction> {
        match result {
            Err(BridgeError::Conflict { id, .. }) => self.load(id).await,
            other => other,
        }
    }

    async fn fail(&self, tx: &BridgeTransaction, reason: &str) -> BridgeResult<BridgeTransaction> {
        let patch = TransactionPatch {
            status: Some(TransactionStatus::Failed),
            error_message: Some(reason.to_string()),
            ..Default::default()
        };
        let failed = self.transition(tx, patch, Some(reason)).await?;
        warn!(tx_id = failed.id, from = %tx.status, reason, "Transaction failed");
        Ok(failed)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Create (or find) the transaction for a source deposit
    ///
    /// A repeated report with the same fields returns the stored transaction unchanged,
    /// whatever state it has reached. Nothing is persisted when the deposit is rejected.
    pub async fn create_transaction(&self, deposit: &Deposit) -> BridgeResult<BridgeTransaction> {
        let result = self.create_inner(deposit).await;
        match &result {
            Ok((_, true)) => metrics::record_deposit("created"),
            Ok((_, false)) => metrics::record_deposit("duplicate"),
            Err(_) => metrics::record_deposit("rejected"),
        }
        result.map(|(tx, _)| tx)
    }

    fn check_duplicate(
        existing: BridgeTransaction,
        deposit: &Deposit,
    ) -> BridgeResult<(BridgeTransaction, bool)> {
        if existing.matches_deposit(deposit) {
            debug!(
                tx_id = existing.id,
                source_tx_hash = %existing.source_tx_hash,
                status = %existing.status,
                "Duplicate deposit report"
            );
            return Ok((existing, false));
        }
        warn!(
            tx_id = existing.id,
            bridge_id = existing.bridge_id,
            source_tx_hash = %existing.source_tx_hash,
            "Deposit report conflicts with recorded transaction"
        );
        Err(IntegrityError::DuplicateSourceTx {
            bridge_id: existing.bridge_id,
            source_tx_hash: existing.source_tx_hash,
        }
        .into())
    }

    async fn create_inner(&self, deposit: &Deposit) -> BridgeResult<(BridgeTransaction, bool)> {
        let source_tx_hash = deposit.source_tx_hash.trim();
        if source_tx_hash.is_empty() {
            return Err(ConfigError::InvalidDeposit("source_tx_hash is empty".into()).into());
        }
        if deposit.source_address.trim().is_empty() || deposit.target_address.trim().is_empty() {
            return Err(ConfigError::InvalidDeposit("addresses must not be empty".into()).into());
        }

        if let Some(existing) = self
            .store
            .find_transaction_by_source(deposit.bridge_id, source_tx_hash)
            .await?
        {
            return Self::check_duplicate(existing, deposit);
        }

        let bridge = self.bridges.get(deposit.bridge_id).await?;
        if !bridge.status.accepts_deposits() {
            return Err(ConfigError::BridgeNotActive {
                bridge_id: bridge.id,
                status: bridge.status,
            }
            .into());
        }

        let symbol = normalize_symbol(&deposit.token_symbol);
        let token = self
            .store
            .get_token(bridge.id, &symbol)
            .await?
            .ok_or_else(|| ConfigError::TokenNotSupported {
                bridge_id: bridge.id,
                symbol: symbol.clone(),
            })?;
        if !token.enabled {
            return Err(ConfigError::TokenDisabled {
                bridge_id: bridge.id,
                symbol,
            }
            .into());
        }

        if deposit.amount <= BigDecimal::zero() {
            return Err(ConfigError::NonPositiveAmount.into());
        }
        if deposit.amount < bridge.min_amount || deposit.amount > bridge.max_amount {
            return Err(ConfigError::AmountOutOfRange {
                amount: deposit.amount.clone(),
                min: bridge.min_amount.clone(),
                max: bridge.max_amount.clone(),
            }
            .into());
        }

        let rescaled = rescale(&deposit.amount, token.source_decimals, token.target_decimals)
            .map_err(ConfigError::from)?;
        if rescaled.target_amount.is_zero() {
            return Err(ConfigError::InvalidDeposit(format!(
                "amount {} rounds to zero at {} target decimals",
                deposit.amount, token.target_decimals
            ))
            .into());
        }

        let payload_hash = compute_payload_hash(&PayloadFields {
            bridge_id: bridge.id,
            source_tx_hash,
            amount: &deposit.amount,
            source_address: deposit.source_address.trim(),
            target_address: deposit.target_address.trim(),
            token_symbol: &symbol,
        });

        let new_tx = NewTransaction {
            bridge_id: bridge.id,
            source_tx_hash: source_tx_hash.to_string(),
            source_address: deposit.source_address.trim().to_string(),
            target_address: deposit.target_address.trim().to_string(),
            amount: deposit.amount.clone(),
            token_symbol: symbol,
            target_amount: rescaled.target_amount,
            rescale_dust: rescaled.dust,
            payload_hash: bytes32_to_hex(&payload_hash),
        };

        let (tx, created) = self.store.insert_transaction_if_absent(&new_tx).await?;
        if !created {
            // Another report of the same deposit won the insert
            return Self::check_duplicate(tx, deposit);
        }

        info!(
            tx_id = tx.id,
            bridge_id = tx.bridge_id,
            source_tx_hash = %tx.source_tx_hash,
            amount = %tx.amount,
            target_amount = %tx.target_amount,
            dust = %tx.rescale_dust,
            token = %tx.token_symbol,
            "Transaction created"
        );
        Ok((tx, true))
    }

    /// Watcher entry point: create or find the transaction, then record confirmations
    pub async fn report_deposit(&self, deposit: &Deposit) -> BridgeResult<BridgeTransaction> {
        let tx = self.create_transaction(deposit).await?;
        if tx.status.is_terminal() {
            return Ok(tx);
        }
        let confirmed = self.confirm_source(tx.id, deposit.confirmations).await;
        self.settle_conflict(confirmed).await
    }

    /// Record the source-chain confirmation count
    ///
    /// A count lower than the last one seen is a reorg: it is stored and the transaction
    /// keeps waiting. Reports after `SOURCE_CONFIRMED` change nothing.
    pub async fn confirm_source(&self, id: i64, count: u64) -> BridgeResult<BridgeTransaction> {
        let mut tx = self.load(id).await?;
        if tx.status.is_terminal() {
            return Err(BridgeError::TerminalState {
                id,
                status: tx.status,
            });
        }
        if !tx.status.is_cancellable() {
            debug!(tx_id = id, status = %tx.status, count, "Confirmation report after source confirmed");
            return Ok(tx);
        }

        let bridge = self.bridges.get(tx.bridge_id).await?;
        let count = i64::try_from(count).unwrap_or(i64::MAX);

        if tx.status == TransactionStatus::Initiated {
            let patch = TransactionPatch {
                status: Some(TransactionStatus::PendingSourceConfirmation),
                confirmations: Some(count),
                ..Default::default()
            };
            tx = self.transition(&tx, patch, None).await?;
        } else if count < tx.confirmations {
            warn!(
                tx_id = id,
                previous = tx.confirmations,
                count,
                "Source confirmations regressed (reorg), waiting again"
            );
            let patch = TransactionPatch {
                confirmations: Some(count),
                ..Default::default()
            };
            tx = self.transition(&tx, patch, None).await?;
        } else if count != tx.confirmations {
            let patch = TransactionPatch {
                confirmations: Some(count),
                ..Default::default()
            };
            tx = self.transition(&tx, patch, None).await?;
        }

        if count >= bridge.required_confirmations {
            tx = self
                .transition(&tx, TransactionPatch::status(TransactionStatus::SourceConfirmed), None)
                .await?;
            info!(
                tx_id = id,
                confirmations = count,
                required = bridge.required_confirmations,
                "Source deposit confirmed"
            );
        } else {
            debug!(
                tx_id = id,
                confirmations = count,
                required = bridge.required_confirmations,
                "Waiting for source confirmations"
            );
        }
        Ok(tx)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Snapshot the threshold and eligible roster, move to `PENDING_VALIDATION` and
    /// broadcast the attestation request
    pub async fn request_validation(&self, id: i64) -> BridgeResult<BridgeTransaction> {
        let tx = self.load(id).await?;
        match tx.status {
            TransactionStatus::PendingValidation => return Ok(tx),
            TransactionStatus::SourceConfirmed => {}
            status if status.is_terminal() => {
                return Err(BridgeError::TerminalState { id, status });
            }
            status => {
                return Err(BridgeError::InvalidTransition {
                    from: status,
                    to: TransactionStatus::PendingValidation,
                });
            }
        }

        let bridge = self.bridges.get(tx.bridge_id).await?;
        let roster = self.validators.list_active(tx.bridge_id).await?;
        let threshold = bridge.validator_threshold;
        if roster.len() < threshold.max(0) as usize {
            return Err(TransientError::InsufficientValidators {
                eligible: roster.len(),
                threshold,
            }
            .into());
        }

        let patch = TransactionPatch {
            status: Some(TransactionStatus::PendingValidation),
            quorum_threshold: Some(threshold),
            validator_roster: Some(roster.iter().map(|v| v.id).collect()),
            ..Default::default()
        };
        let tx = self.transition(&tx, patch, None).await?;
        info!(
            tx_id = id,
            threshold,
            roster = roster.len(),
            payload_hash = %tx.payload_hash,
            "Validation requested"
        );

        let request = AttestationRequest::for_transaction(&tx);
        if let Err(e) = with_timeout(
            self.settings.timeouts.external_call_timeout,
            self.transport.broadcast(&request, &roster),
        )
        .await
        {
            warn!(tx_id = id, error = %e, "Attestation broadcast failed, validators must poll");
        }
        Ok(tx)
    }

    /// Record one validator's signature over the payload hash
    pub async fn submit_attestation(
        &self,
        id: i64,
        validator_id: i64,
        signature: &str,
    ) -> BridgeResult<AttestationOutcome> {
        let tx = self.load(id).await?;

        let existing = self.store.list_attestations(id).await?;
        if existing.iter().any(|a| a.validator_id == validator_id) {
            metrics::record_attestation("duplicate");
            debug!(tx_id = id, validator_id, "Duplicate attestation ignored");
            return Ok(AttestationOutcome {
                transaction: tx,
                accepted: false,
                attestation_count: existing.len() as i64,
            });
        }

        if tx.status.is_terminal() {
            return Err(BridgeError::TerminalState {
                id,
                status: tx.status,
            });
        }
        if tx.status != TransactionStatus::PendingValidation {
            return Err(BridgeError::InvalidTransition {
                from: tx.status,
                to: TransactionStatus::Validated,
            });
        }
        if !tx.validator_roster.contains(&validator_id) {
            metrics::record_attestation("rejected");
            return Err(BridgeError::NotEligible {
                validator_id,
                reason: "not in the validator roster for this transaction".into(),
            });
        }

        let validator = self.validators.get(validator_id).await?;
        if !self.validators.eligible_at(&validator, Utc::now()) {
            metrics::record_attestation("rejected");
            return Err(BridgeError::NotEligible {
                validator_id,
                reason: format!(
                    "status {}, reputation {}, last heartbeat {:?}",
                    validator.status, validator.reputation, validator.last_heartbeat
                ),
            });
        }

        let payload_hash = bytes32_from_hex(&tx.payload_hash).map_err(StoreError::Corrupt)?;
        if let Err(e) = self
            .validators
            .verifier()
            .verify(&validator.public_key, &payload_hash, signature)
        {
            metrics::record_attestation("rejected");
            self.store
                .record_rejected_attestation(&RejectedAttestation {
                    transaction_id: id,
                    validator_id,
                    signature: signature.to_string(),
                    reason: e.to_string(),
                    created_at: Utc::now(),
                })
                .await?;
            self.validators
                .adjust_reputation(
                    validator_id,
                    -self.validators.policy().invalid_signature_penalty,
                    REASON_INVALID_SIGNATURE,
                )
                .await?;
            warn!(tx_id = id, validator_id, error = %e, "Invalid attestation signature");
            return Err(IntegrityError::InvalidSignature {
                validator_id,
                reason: e.to_string(),
            }
            .into());
        }

        let appended = self
            .store
            .append_attestation(&Attestation {
                transaction_id: id,
                validator_id,
                signature: signature.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        match appended {
            AppendOutcome::Appended => {}
            AppendOutcome::Duplicate => {
                metrics::record_attestation("duplicate");
                return Ok(AttestationOutcome {
                    transaction: self.load(id).await?,
                    accepted: false,
                    attestation_count: self.store.count_attestations(id).await?,
                });
            }
            AppendOutcome::Closed(status) => {
                metrics::record_attestation("rejected");
                debug!(tx_id = id, validator_id, status = %status, "Attestation arrived after transaction moved on");
                return Err(if status.is_terminal() {
                    BridgeError::TerminalState { id, status }
                } else {
                    BridgeError::InvalidTransition {
                        from: status,
                        to: TransactionStatus::Validated,
                    }
                });
            }
        }
        metrics::record_attestation("accepted");
        let attestation_count = self.store.count_attestations(id).await?;
        debug!(
            tx_id = id,
            validator_id,
            count = attestation_count,
            threshold = ?tx.quorum_threshold,
            "Attestation recorded"
        );

        let transaction = match self.validate_if_quorate(&tx, attestation_count).await? {
            Some(validated) => validated,
            None => tx,
        };
        Ok(AttestationOutcome {
            transaction,
            accepted: true,
            attestation_count,
        })
    }

    /// Move a `PENDING_VALIDATION` transaction to `VALIDATED` once `attestation_count`
    /// reaches its snapshotted threshold. `None` when the threshold is not met.
    async fn validate_if_quorate(
        &self,
        tx: &BridgeTransaction,
        attestation_count: i64,
    ) -> BridgeResult<Option<BridgeTransaction>> {
        let Some(threshold) = tx.quorum_threshold else {
            return Ok(None);
        };
        if attestation_count < threshold as i64 {
            return Ok(None);
        }
        let validated = self
            .transition(tx, TransactionPatch::status(TransactionStatus::Validated), None)
            .await;
        if validated.is_ok() {
            info!(
                tx_id = tx.id,
                attestations = attestation_count,
                threshold,
                "Quorum reached"
            );
        }
        self.settle_conflict(validated).await.map(Some)
    }

    /// Validate every `PENDING_VALIDATION` transaction that already holds a quorum of
    /// attestations. Picks up transactions whose quorum transition did not land when the
    /// last attestation was recorded. Returns those moved to `VALIDATED`.
    pub async fn reconcile_quorum(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        let mut validated = Vec::new();
        for tx in self
            .store
            .list_transactions_by_status(&[TransactionStatus::PendingValidation], SCAN_LIMIT)
            .await?
        {
            if let Some(done) = self.reconcile_one(&tx).await? {
                validated.push(done);
            }
        }
        Ok(validated)
    }

    async fn reconcile_one(&self, tx: &BridgeTransaction) -> BridgeResult<Option<BridgeTransaction>> {
        let count = self.store.count_attestations(tx.id).await?;
        let result = self.validate_if_quorate(tx, count).await?;
        Ok(result.filter(|done| done.status == TransactionStatus::Validated))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn build_execution_request(&self, tx: &BridgeTransaction) -> BridgeResult<ExecutionRequest> {
        let bridge = self.bridges.get(tx.bridge_id).await?;
        let token = self.tokens.get(tx.bridge_id, &tx.token_symbol).await?;
        let attestations = self.store.list_attestations(tx.id).await?;
        Ok(ExecutionRequest {
            transaction_id: tx.id,
            attempt_id: tx.execution_attempt_id,
            target_network: bridge.target_network,
            target_address: tx.target_address.clone(),
            target_token_address: token.target_token_address,
            target_amount: tx.target_amount.clone(),
            payload_hash: tx.payload_hash.clone(),
            attestations,
        })
    }

    /// Move a `VALIDATED` transaction to `PENDING_TARGET_EXECUTION` and submit it
    pub async fn execute_target(&self, id: i64) -> BridgeResult<ExecutionResult> {
        let tx = self.load(id).await?;
        match tx.status {
            TransactionStatus::Validated => {}
            TransactionStatus::PendingTargetExecution => return Ok(ExecutionResult::unchanged(tx)),
            status if status.is_terminal() => {
                return Err(BridgeError::TerminalState { id, status });
            }
            status => {
                return Err(BridgeError::InvalidTransition {
                    from: status,
                    to: TransactionStatus::PendingTargetExecution,
                });
            }
        }

        let patch = TransactionPatch {
            status: Some(TransactionStatus::PendingTargetExecution),
            execution_attempt_id: Some(tx.execution_attempt_id + 1),
            ..Default::default()
        };
        let tx = self.transition(&tx, patch, None).await?;
        self.submit_until_settled(tx).await
    }

    /// Submit the current attempt, retrying transient failures with backoff. Each retry
    /// takes a new attempt id so late results for older attempts are recognisable.
    async fn submit_until_settled(&self, mut tx: BridgeTransaction) -> BridgeResult<ExecutionResult> {
        loop {
            let request = self.build_execution_request(&tx).await?;
            info!(
                tx_id = tx.id,
                attempt_id = tx.execution_attempt_id,
                network = %request.target_network,
                "Submitting target execution"
            );

            let submitted = with_timeout(
                self.settings.timeouts.external_call_timeout,
                self.executor.submit(&request),
            )
            .await;

            match submitted {
                Ok(SubmitOutcome::Completed { target_tx_hash }) => {
                    return self.complete(&tx, &target_tx_hash).await;
                }
                Ok(SubmitOutcome::Accepted) => {
                    metrics::record_execution("accepted");
                    debug!(
                        tx_id = tx.id,
                        attempt_id = tx.execution_attempt_id,
                        "Execution accepted, awaiting result"
                    );
                    return Ok(ExecutionResult::unchanged(tx));
                }
                Ok(SubmitOutcome::Rejected { reason }) => {
                    return self.revert(&tx, &reason).await;
                }
                Err(e) => {
                    metrics::record_execution("transient");
                    match self.next_attempt(&tx, &e.to_string()).await? {
                        NextAttempt::Retry(next) => tx = next,
                        NextAttempt::Done(result) => return Ok(result),
                    }
                }
            }
        }
    }

    /// After a transient failure: back off and take a new attempt id, or fail closed once
    /// the retry budget is spent
    async fn next_attempt(&self, tx: &BridgeTransaction, error: &str) -> BridgeResult<NextAttempt> {
        let retries = tx.execution_retries.max(0) as u32;
        let retry = &self.settings.retry;
        if !retry.should_retry(retries) {
            metrics::record_execution("exhausted");
            error!(tx_id = tx.id, retries, error, "Execution retries exhausted");
            let failed = self
                .settle_conflict(self.fail(tx, &ExecutionError::RetriesExhausted.to_string()).await)
                .await?;
            return Ok(NextAttempt::Done(ExecutionResult::unchanged(failed)));
        }

        let backoff = retry.backoff_for_attempt(retries);
        warn!(
            tx_id = tx.id,
            attempt_id = tx.execution_attempt_id,
            retries,
            ?backoff,
            error,
            "Transient execution failure, retrying"
        );
        tokio::time::sleep(backoff).await;

        let patch = TransactionPatch {
            execution_attempt_id: Some(tx.execution_attempt_id + 1),
            execution_retries: Some(tx.execution_retries + 1),
            ..Default::default()
        };
        match self.transition(tx, patch, None).await {
            Ok(next) => Ok(NextAttempt::Retry(next)),
            Err(BridgeError::Conflict { .. }) | Err(BridgeError::TerminalState { .. }) => {
                // A result report or timeout settled the transaction meanwhile
                Ok(NextAttempt::Done(ExecutionResult::unchanged(self.load(tx.id).await?)))
            }
            Err(e) => Err(e),
        }
    }

    async fn complete(&self, tx: &BridgeTransaction, target_tx_hash: &str) -> BridgeResult<ExecutionResult> {
        let now = Utc::now();
        let patch = TransactionPatch {
            status: Some(TransactionStatus::Completed),
            target_tx_hash: Some(target_tx_hash.to_string()),
            completed_at: Some(now),
            ..Default::default()
        };
        let completed = self.settle_conflict(self.transition(tx, patch, None).await).await?;
        if completed.status == TransactionStatus::Completed {
            metrics::record_execution("completed");
            metrics::record_settlement_latency(
                (now - completed.created_at).num_milliseconds() as f64 / 1000.0,
            );
            info!(
                tx_id = completed.id,
                target_tx_hash,
                target_amount = %completed.target_amount,
                "Transaction completed"
            );
        }
        Ok(ExecutionResult::unchanged(completed))
    }

    async fn revert(&self, tx: &BridgeTransaction, reason: &str) -> BridgeResult<ExecutionResult> {
        let message = ExecutionError::Rejected(reason.to_string()).to_string();
        let patch = TransactionPatch {
            status: Some(TransactionStatus::Reverted),
            error_message: Some(message.clone()),
            refund_required: Some(true),
            ..Default::default()
        };
        let reverted = match self.transition(tx, patch, Some(&message)).await {
            Ok(reverted) => reverted,
            Err(BridgeError::Conflict { .. }) => {
                return Ok(ExecutionResult::unchanged(self.load(tx.id).await?));
            }
            Err(e) => return Err(e),
        };

        metrics::record_execution("reverted");
        let refund = RefundObligation::for_transaction(&reverted, reason);
        warn!(
            tx_id = reverted.id,
            reason,
            refund_address = %refund.refund_address,
            "Target rejected execution, refund required"
        );
        self.settlement.refund_required(&refund).await;
        Ok(ExecutionResult {
            transaction: reverted,
            refund: Some(refund),
        })
    }

    /// Watcher report of the final target-chain outcome for one attempt
    ///
    /// Reports for an attempt other than the current one are ignored.
    pub async fn report_target_execution_result(
        &self,
        id: i64,
        attempt_id: i64,
        outcome: ExecutionOutcome,
    ) -> BridgeResult<ExecutionResult> {
        let tx = self.load(id).await?;
        if tx.status.is_terminal() {
            return Err(BridgeError::TerminalState {
                id,
                status: tx.status,
            });
        }
        if tx.status != TransactionStatus::PendingTargetExecution
            || attempt_id != tx.execution_attempt_id
        {
            debug!(
                tx_id = id,
                attempt_id,
                current_attempt = tx.execution_attempt_id,
                status = %tx.status,
                "Ignoring stale execution report"
            );
            return Ok(ExecutionResult::unchanged(tx));
        }

        match outcome {
            ExecutionOutcome::Success { target_tx_hash } => self.complete(&tx, &target_tx_hash).await,
            ExecutionOutcome::Rejected { reason } => self.revert(&tx, &reason).await,
            ExecutionOutcome::Transient { reason } => {
                metrics::record_execution("transient");
                match self.next_attempt(&tx, &reason).await? {
                    NextAttempt::Retry(next) => self.submit_until_settled(next).await,
                    NextAttempt::Done(result) => Ok(result),
                }
            }
        }
    }

    // ========================================================================
    // Timeouts and cancellation
    // ========================================================================

    /// Fail every transaction that has sat in a waiting state past its deadline.
    /// Returns the transactions moved to `FAILED`.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> BridgeResult<Vec<BridgeTransaction>> {
        let timeouts = &self.settings.timeouts;
        let validation_reason = QuorumError::ValidationWindowExpired.to_string();
        let rules: [(&[TransactionStatus], std::time::Duration, &str); 3] = [
            (
                &[
                    TransactionStatus::Initiated,
                    TransactionStatus::PendingSourceConfirmation,
                ],
                timeouts.confirmation_timeout,
                REASON_CONFIRMATION_TIMEOUT,
            ),
            (
                &[
                    TransactionStatus::SourceConfirmed,
                    TransactionStatus::PendingValidation,
                ],
                timeouts.validation_window,
                &validation_reason,
            ),
            (
                &[TransactionStatus::PendingTargetExecution],
                timeouts.execution_timeout,
                REASON_EXECUTION_TIMEOUT,
            ),
        ];

        let mut failed = Vec::new();
        for (statuses, limit, reason) in rules {
            let limit = chrono::Duration::from_std(limit)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
            for tx in self.store.list_transactions_by_status(statuses, SCAN_LIMIT).await? {
                if now.signed_duration_since(tx.status_changed_at) <= limit {
                    continue;
                }
                // A quorate transaction is validated, not timed out
                if tx.status == TransactionStatus::PendingValidation
                    && self.reconcile_one(&tx).await?.is_some()
                {
                    continue;
                }
                match self.fail(&tx, reason).await {
                    Ok(tx) => failed.push(tx),
                    Err(BridgeError::Conflict { id, current }) => {
                        debug!(tx_id = id, current = %current, "Timed-out transaction moved on");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(failed)
    }

    /// Abandon a transaction that has not been source-confirmed yet
    pub async fn cancel(&self, id: i64, reason: &str) -> BridgeResult<BridgeTransaction> {
        let tx = self.load(id).await?;
        if tx.status.is_terminal() {
            return Err(BridgeError::TerminalState {
                id,
                status: tx.status,
            });
        }
        if !tx.status.is_cancellable() {
            return Err(BridgeError::InvalidTransition {
                from: tx.status,
                to: TransactionStatus::Failed,
            });
        }
        self.fail(&tx, &format!("cancelled: {}", reason)).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, id: i64) -> BridgeResult<BridgeTransaction> {
        self.load(id).await
    }

    pub async fn find_by_source(
        &self,
        bridge_id: i64,
        source_tx_hash: &str,
    ) -> BridgeResult<BridgeTransaction> {
        self.store
            .find_transaction_by_source(bridge_id, source_tx_hash.trim())
            .await?
            .ok_or_else(|| BridgeError::not_found("transaction", format!("{}/{}", bridge_id, source_tx_hash)))
    }

    pub async fn attestations(&self, id: i64) -> BridgeResult<Vec<Attestation>> {
        self.load(id).await?;
        Ok(self.store.list_attestations(id).await?)
    }

    pub async fn rejected_attestations(&self, id: i64) -> BridgeResult<Vec<RejectedAttestation>> {
        self.load(id).await?;
        Ok(self.store.list_rejected_attestations(id).await?)
    }

    /// Oldest first
    pub async fn list_by_status(
        &self,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> BridgeResult<Vec<BridgeTransaction>> {
        Ok(self.store.list_transactions_by_status(statuses, limit).await?)
    }

    pub async fn count_by_status(&self, status: TransactionStatus) -> BridgeResult<i64> {
        Ok(self.store.count_transactions_by_status(status).await?)
    }

    /// Attestation requests still waiting on this validator
    pub async fn pending_requests_for(&self, validator_id: i64) -> BridgeResult<Vec<AttestationRequest>> {
        self.validators.get(validator_id).await?;

        let mut requests = Vec::new();
        for tx in self
            .store
            .list_transactions_by_status(&[TransactionStatus::PendingValidation], SCAN_LIMIT)
            .await?
        {
            if !tx.validator_roster.contains(&validator_id) {
                continue;
            }
            let attested = self
                .store
                .list_attestations(tx.id)
                .await?
                .iter()
                .any(|a| a.validator_id == validator_id);
            if !attested {
                requests.push(AttestationRequest::for_transaction(&tx));
            }
        }
        Ok(requests)
    }
}

enum NextAttempt {
    Retry(BridgeTransaction),
    Done(ExecutionResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::ValidatorPolicy;
    use crate::db::MemoryStore;
    use crate::keys::{EcdsaVerifier, KeyManager};
    use crate::models::{NewBridge, NewToken};
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use bridge_common::{BridgeStatus, ChainId};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted submit results, then completes
    struct ScriptedExecutor {
        script: Mutex<Vec<Result<SubmitOutcome, TransientError>>>,
        attempts: Mutex<Vec<i64>>,
    }

    impl ScriptedExecutor {
        fn new(mut script: Vec<Result<SubmitOutcome, TransientError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TargetExecutor for ScriptedExecutor {
        async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome, TransientError> {
            self.attempts.lock().unwrap().push(request.attempt_id);
            self.script.lock().unwrap().pop().unwrap_or(Ok(SubmitOutcome::Completed {
                target_tx_hash: "0xtarget".into(),
            }))
        }
    }

    struct Harness {
        coordinator: TransactionCoordinator,
        registry: Arc<BridgeRegistry>,
        audit: Arc<MemoryAuditSink>,
        executor: Arc<ScriptedExecutor>,
        keys: Vec<(i64, KeyManager)>,
        bridge_id: i64,
    }

    async fn harness(threshold: i32, validators: usize, script: Vec<Result<SubmitOutcome, TransientError>>) -> Harness {
        let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
        let validator_set = Arc::new(ValidatorSet::new(
            store.clone(),
            Arc::new(EcdsaVerifier),
            ValidatorPolicy::default(),
        ));
        let registry = Arc::new(BridgeRegistry::new(store.clone(), validator_set.clone()));
        let tokens = Arc::new(TokenRegistry::new(store.clone()));

        let bridge = registry
            .create(NewBridge {
                source_network: ChainId::from_u32(1),
                target_network: ChainId::from_u32(137),
                validator_threshold: threshold,
                fee: BigDecimal::from(0),
                min_amount: BigDecimal::from(1),
                max_amount: BigDecimal::from(1_000_000_000u64),
                required_confirmations: 2,
            })
            .await
            .unwrap();
        tokens
            .add(
                bridge.id,
                NewToken {
                    symbol: "USDC".into(),
                    source_token_address: "0xsource".into(),
                    target_token_address: "0xtarget".into(),
                    source_decimals: 6,
                    target_decimals: 6,
                    enabled: true,
                },
            )
            .await
            .unwrap();

        let mut keys = Vec::new();
        for i in 0..validators {
            let key = KeyManager::generate();
            let v = validator_set
                .register(bridge.id, &format!("0xval{}", i), &key.public_key_hex().unwrap())
                .await
                .unwrap();
            validator_set.heartbeat(v.id).await.unwrap();
            keys.push((v.id, key));
        }
        registry.set_status(bridge.id, BridgeStatus::Active).await.unwrap();

        let audit = Arc::new(MemoryAuditSink::new());
        let executor = Arc::new(ScriptedExecutor::new(script));
        let settings = CoordinatorSettings {
            retry: RetryConfig::immediate(2),
            ..Default::default()
        };
        let coordinator = TransactionCoordinator::new(
            store,
            registry.clone(),
            validator_set,
            tokens,
            executor.clone(),
            settings,
        )
        .with_audit(audit.clone())
        .with_settlement(audit.clone());

        Harness {
            coordinator,
            registry,
            audit,
            executor,
            keys,
            bridge_id: bridge.id,
        }
    }

    fn deposit(bridge_id: i64, hash: &str) -> Deposit {
        Deposit {
            bridge_id,
            source_tx_hash: hash.into(),
            source_address: "0xfrom".into(),
            target_address: "0xto".into(),
            amount: BigDecimal::from(50_000_000u64),
            token_symbol: "usdc".into(),
            confirmations: 0,
        }
    }

    impl Harness {
        async fn confirmed(&self, hash: &str) -> BridgeTransaction {
            let tx = self
                .coordinator
                .create_transaction(&deposit(self.bridge_id, hash))
                .await
                .unwrap();
            self.coordinator.confirm_source(tx.id, 2).await.unwrap()
        }

        async fn validated(&self, hash: &str) -> BridgeTransaction {
            let tx = self.confirmed(hash).await;
            let tx = self.coordinator.request_validation(tx.id).await.unwrap();
            self.attest_all(&tx).await
        }

        async fn attest_all(&self, tx: &BridgeTransaction) -> BridgeTransaction {
            let hash = bytes32_from_hex(&tx.payload_hash).unwrap();
            let threshold = tx.quorum_threshold.unwrap() as usize;
            let mut last = tx.clone();
            for (id, key) in self.keys.iter().take(threshold) {
                last = self
                    .coordinator
                    .submit_attestation(tx.id, *id, &key.sign(&hash).unwrap())
                    .await
                    .unwrap()
                    .transaction;
            }
            last
        }
    }

    #[tokio::test]
    async fn test_create_rejects_bad_deposits_without_persisting() {
        let h = harness(1, 1, vec![]).await;

        let mut too_small = deposit(h.bridge_id, "0x01");
        too_small.amount = BigDecimal::from(0);
        assert!(matches!(
            h.coordinator.create_transaction(&too_small).await,
            Err(BridgeError::Config(ConfigError::NonPositiveAmount))
        ));

        let mut unknown_token = deposit(h.bridge_id, "0x02");
        unknown_token.token_symbol = "DOGE".into();
        assert!(matches!(
            h.coordinator.create_transaction(&unknown_token).await,
            Err(BridgeError::Config(ConfigError::TokenNotSupported { .. }))
        ));

        h.registry
            .set_status(h.bridge_id, BridgeStatus::Maintenance)
            .await
            .unwrap();
        assert!(matches!(
            h.coordinator.create_transaction(&deposit(h.bridge_id, "0x03")).await,
            Err(BridgeError::Config(ConfigError::BridgeNotActive { .. }))
        ));

        for hash in ["0x01", "0x02", "0x03"] {
            assert!(h.coordinator.find_by_source(h.bridge_id, hash).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_duplicate_with_different_fields_is_integrity_error() {
        let h = harness(1, 1, vec![]).await;
        let first = h
            .coordinator
            .create_transaction(&deposit(h.bridge_id, "0xabc"))
            .await
            .unwrap();
        let again = h
            .coordinator
            .create_transaction(&deposit(h.bridge_id, "0xabc"))
            .await
            .unwrap();
        assert_eq!(first, again);

        let mut tampered = deposit(h.bridge_id, "0xabc");
        tampered.amount = BigDecimal::from(60_000_000u64);
        assert!(matches!(
            h.coordinator.create_transaction(&tampered).await,
            Err(BridgeError::Integrity(IntegrityError::DuplicateSourceTx { .. }))
        ));
    }

    #[tokio::test]
    async fn test_confirmation_progress_and_reorg() {
        let h = harness(1, 1, vec![]).await;
        let tx = h
            .coordinator
            .create_transaction(&deposit(h.bridge_id, "0xabc"))
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Initiated);

        let tx = h.coordinator.confirm_source(tx.id, 1).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::PendingSourceConfirmation);
        assert_eq!(tx.confirmations, 1);

        // Reorg drops the count; still pending
        let tx = h.coordinator.confirm_source(tx.id, 0).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::PendingSourceConfirmation);
        assert_eq!(tx.confirmations, 0);

        let tx = h.coordinator.confirm_source(tx.id, 2).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::SourceConfirmed);

        // Later reports are ignored
        let tx = h.coordinator.confirm_source(tx.id, 1).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::SourceConfirmed);
        assert_eq!(tx.confirmations, 2);
    }

    #[tokio::test]
    async fn test_request_validation_needs_enough_validators() {
        let h = harness(2, 2, vec![]).await;
        let tx = h.confirmed("0xabc").await;

        // Drop one validator out of the eligible set
        let (gone, _) = &h.keys[0];
        h.coordinator
            .validators
            .suspend(*gone, "maintenance")
            .await
            .unwrap();

        assert!(matches!(
            h.coordinator.request_validation(tx.id).await,
            Err(BridgeError::Transient(TransientError::InsufficientValidators {
                eligible: 1,
                threshold: 2
            }))
        ));
        assert_eq!(
            h.coordinator.get(tx.id).await.unwrap().status,
            TransactionStatus::SourceConfirmed
        );
    }

    #[tokio::test]
    async fn test_invalid_signature_penalises_only_sender() {
        let h = harness(2, 3, vec![]).await;
        let tx = h.confirmed("0xabc").await;
        let tx = h.coordinator.request_validation(tx.id).await.unwrap();

        let (bad_id, _) = &h.keys[0];
        let wrong = KeyManager::generate()
            .sign(&bytes32_from_hex(&tx.payload_hash).unwrap())
            .unwrap();
        assert!(matches!(
            h.coordinator.submit_attestation(tx.id, *bad_id, &wrong).await,
            Err(BridgeError::Integrity(IntegrityError::InvalidSignature { .. }))
        ));

        assert_eq!(h.coordinator.validators.get(*bad_id).await.unwrap().reputation, 40);
        assert_eq!(h.coordinator.validators.get(h.keys[1].0).await.unwrap().reputation, 50);
        assert_eq!(h.coordinator.rejected_attestations(tx.id).await.unwrap().len(), 1);
        assert!(h.coordinator.attestations(tx.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attestation_outside_roster_rejected() {
        let h = harness(1, 1, vec![]).await;
        let tx = h.confirmed("0xabc").await;
        let tx = h.coordinator.request_validation(tx.id).await.unwrap();

        let key = KeyManager::generate();
        let late = h
            .coordinator
            .validators
            .register(h.bridge_id, "0xlate", &key.public_key_hex().unwrap())
            .await
            .unwrap();
        h.coordinator.validators.heartbeat(late.id).await.unwrap();

        let signature = key.sign(&bytes32_from_hex(&tx.payload_hash).unwrap()).unwrap();
        assert!(matches!(
            h.coordinator.submit_attestation(tx.id, late.id, &signature).await,
            Err(BridgeError::NotEligible { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_completes() {
        let h = harness(2, 3, vec![]).await;
        let tx = h.validated("0xabc").await;
        assert_eq!(tx.status, TransactionStatus::Validated);

        let result = h.coordinator.execute_target(tx.id).await.unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Completed);
        assert_eq!(result.transaction.target_tx_hash.as_deref(), Some("0xtarget"));
        assert!(result.transaction.completed_at.is_some());
        assert!(result.refund.is_none());

        let statuses: Vec<_> = h.audit.events_for(tx.id).iter().map(|e| e.to).collect();
        assert_eq!(
            statuses,
            vec![
                TransactionStatus::PendingSourceConfirmation,
                TransactionStatus::SourceConfirmed,
                TransactionStatus::PendingValidation,
                TransactionStatus::Validated,
                TransactionStatus::PendingTargetExecution,
                TransactionStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_bump_attempt_then_succeed() {
        let h = harness(1, 1, vec![
            Err(TransientError::Network("down".into())),
            Err(TransientError::Timeout(10)),
        ])
        .await;
        let tx = h.validated("0xabc").await;

        let result = h.coordinator.execute_target(tx.id).await.unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Completed);
        assert_eq!(result.transaction.execution_retries, 2);
        assert_eq!(*h.executor.attempts.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let h = harness(1, 1, vec![
            Err(TransientError::Network("down".into())),
            Err(TransientError::Network("down".into())),
            Err(TransientError::Network("down".into())),
        ])
        .await;
        let tx = h.validated("0xabc").await;

        let result = h.coordinator.execute_target(tx.id).await.unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Failed);
        assert_eq!(
            result.transaction.error_message.as_deref(),
            Some("execution_retries_exhausted")
        );
    }

    #[tokio::test]
    async fn test_rejection_reverts_with_refund() {
        let h = harness(1, 1, vec![Ok(SubmitOutcome::Rejected {
            reason: "recipient blocked".into(),
        })])
        .await;
        let tx = h.validated("0xabc").await;

        let result = h.coordinator.execute_target(tx.id).await.unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Reverted);
        assert!(result.transaction.refund_required);
        let refund = result.refund.unwrap();
        assert_eq!(refund.refund_address, "0xfrom");
        assert_eq!(refund.amount, BigDecimal::from(50_000_000u64));
        assert_eq!(h.audit.refunds(), vec![refund]);
    }

    #[tokio::test]
    async fn test_stale_attempt_reports_ignored() {
        let h = harness(1, 1, vec![Ok(SubmitOutcome::Accepted)]).await;
        let tx = h.validated("0xabc").await;
        let pending = h.coordinator.execute_target(tx.id).await.unwrap().transaction;
        assert_eq!(pending.status, TransactionStatus::PendingTargetExecution);
        assert_eq!(pending.execution_attempt_id, 1);

        let stale = h
            .coordinator
            .report_target_execution_result(
                tx.id,
                0,
                ExecutionOutcome::Rejected {
                    reason: "old attempt".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(stale.transaction, pending);

        let done = h
            .coordinator
            .report_target_execution_result(
                tx.id,
                1,
                ExecutionOutcome::Success {
                    target_tx_hash: "0xfinal".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.transaction.status, TransactionStatus::Completed);
        assert_eq!(done.transaction.target_tx_hash.as_deref(), Some("0xfinal"));
    }

    #[tokio::test]
    async fn test_transient_report_resubmits_with_new_attempt() {
        let h = harness(1, 1, vec![Ok(SubmitOutcome::Accepted)]).await;
        let tx = h.validated("0xabc").await;
        h.coordinator.execute_target(tx.id).await.unwrap();

        let result = h
            .coordinator
            .report_target_execution_result(
                tx.id,
                1,
                ExecutionOutcome::Transient {
                    reason: "nonce too low".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Completed);
        assert_eq!(result.transaction.execution_attempt_id, 2);
        assert_eq!(*h.executor.attempts.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sweep_timeouts_per_state() {
        let h = harness(1, 1, vec![Ok(SubmitOutcome::Accepted)]).await;
        let waiting = h
            .coordinator
            .create_transaction(&deposit(h.bridge_id, "0x01"))
            .await
            .unwrap();
        let confirmed = h.confirmed("0x02").await;
        let executing = h.validated("0x03").await;
        h.coordinator.execute_target(executing.id).await.unwrap();

        // Nothing expired yet
        assert!(h.coordinator.sweep_timeouts(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::hours(2);
        let failed = h.coordinator.sweep_timeouts(later).await.unwrap();
        assert_eq!(failed.len(), 3);

        let reason = |id| {
            failed
                .iter()
                .find(|tx| tx.id == id)
                .and_then(|tx| tx.error_message.clone())
        };
        assert_eq!(reason(waiting.id).as_deref(), Some("confirmation_timeout"));
        assert_eq!(reason(confirmed.id).as_deref(), Some("validation_timeout"));
        assert_eq!(reason(executing.id).as_deref(), Some("execution_timeout"));
    }

    #[tokio::test]
    async fn test_cancel_only_before_source_confirmed() {
        let h = harness(1, 1, vec![]).await;
        let early = h
            .coordinator
            .create_transaction(&deposit(h.bridge_id, "0x01"))
            .await
            .unwrap();
        let cancelled = h.coordinator.cancel(early.id, "user request").await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some("cancelled: user request"));

        let confirmed = h.confirmed("0x02").await;
        assert!(matches!(
            h.coordinator.cancel(confirmed.id, "too late").await,
            Err(BridgeError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.coordinator.cancel(early.id, "again").await,
            Err(BridgeError::TerminalState { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_requests_for_validator() {
        let h = harness(2, 3, vec![]).await;
        let tx = h.confirmed("0xabc").await;
        let tx = h.coordinator.request_validation(tx.id).await.unwrap();

        let (first, key) = &h.keys[0];
        assert_eq!(h.coordinator.pending_requests_for(*first).await.unwrap().len(), 1);

        let signature = key.sign(&bytes32_from_hex(&tx.payload_hash).unwrap()).unwrap();
        h.coordinator
            .submit_attestation(tx.id, *first, &signature)
            .await
            .unwrap();
        assert!(h.coordinator.pending_requests_for(*first).await.unwrap().is_empty());
        assert_eq!(h.coordinator.pending_requests_for(h.keys[1].0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_external_call_timeout_is_transient() {
        struct Hanging;

        #[async_trait]
        impl TargetExecutor for Hanging {
            async fn submit(&self, _: &ExecutionRequest) -> Result<SubmitOutcome, TransientError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(SubmitOutcome::Accepted)
            }
        }

        let h = harness(1, 1, vec![]).await;
        let tx = h.validated("0xabc").await;

        let mut coordinator = TransactionCoordinator::new(
            h.coordinator.store.clone(),
            h.coordinator.bridges.clone(),
            h.coordinator.validators.clone(),
            h.coordinator.tokens.clone(),
            Arc::new(Hanging),
            h.coordinator.settings.clone(),
        );
        coordinator.settings.timeouts.external_call_timeout = Duration::from_millis(20);
        coordinator.settings.retry = RetryConfig::immediate(0);

        let result = coordinator.execute_target(tx.id).await.unwrap();
        assert_eq!(result.transaction.status, TransactionStatus::Failed);
    }
}
