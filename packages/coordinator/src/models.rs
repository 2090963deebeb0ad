//! Domain records shared by the registries, the coordinator and both stores.

use bigdecimal::BigDecimal;
use bridge_common::{BridgeStatus, ChainId, TransactionStatus, ValidatorStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Bridge configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub id: i64,
    pub source_network: ChainId,
    pub target_network: ChainId,
    pub status: BridgeStatus,
    pub validator_threshold: i32,
    pub fee: BigDecimal,
    pub min_amount: BigDecimal,
    pub max_amount: BigDecimal,
    pub required_confirmations: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For creating a bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBridge {
    pub source_network: ChainId,
    pub target_network: ChainId,
    pub validator_threshold: i32,
    pub fee: BigDecimal,
    pub min_amount: BigDecimal,
    pub max_amount: BigDecimal,
    pub required_confirmations: i64,
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeUpdate {
    pub validator_threshold: Option<i32>,
    pub fee: Option<BigDecimal>,
    pub min_amount: Option<BigDecimal>,
    pub max_amount: Option<BigDecimal>,
    pub required_confirmations: Option<i64>,
}

// ============================================================================
// Validators
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub id: i64,
    pub bridge_id: i64,
    pub address: String,
    pub public_key: String,
    pub status: ValidatorStatus,
    pub reputation: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewValidator {
    pub bridge_id: i64,
    pub address: String,
    pub public_key: String,
    pub reputation: i32,
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedToken {
    pub bridge_id: i64,
    pub symbol: String,
    pub source_token_address: String,
    pub target_token_address: String,
    pub source_decimals: u8,
    pub target_decimals: u8,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewToken {
    pub symbol: String,
    pub source_token_address: String,
    pub target_token_address: String,
    pub source_decimals: u8,
    pub target_decimals: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUpdate {
    pub source_token_address: Option<String>,
    pub target_token_address: Option<String>,
    pub source_decimals: Option<u8>,
    pub target_decimals: Option<u8>,
}

// ============================================================================
// Attestations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Invalid-signature attempt. Append-only, never counted toward quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAttestation {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: i64,
    pub bridge_id: i64,
    pub source_tx_hash: String,
    pub source_address: String,
    pub target_address: String,
    pub amount: BigDecimal,
    pub token_symbol: String,
    pub target_amount: BigDecimal,
    pub rescale_dust: BigDecimal,
    pub status: TransactionStatus,
    pub confirmations: i64,
    pub payload_hash: String,
    /// Threshold snapshot taken when validation was requested
    pub quorum_threshold: Option<i32>,
    /// Validator ids eligible to attest, snapshot taken with the threshold
    pub validator_roster: Vec<i64>,
    pub execution_attempt_id: i64,
    pub execution_retries: i32,
    pub target_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub refund_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BridgeTransaction {
    /// Whether a repeated deposit report describes the same transfer
    pub fn matches_deposit(&self, deposit: &Deposit) -> bool {
        self.source_address == deposit.source_address
            && self.target_address == deposit.target_address
            && self.amount == deposit.amount
            && self.token_symbol.eq_ignore_ascii_case(&deposit.token_symbol)
    }
}

/// For inserting a new transaction (all derived fields already computed)
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub bridge_id: i64,
    pub source_tx_hash: String,
    pub source_address: String,
    pub target_address: String,
    pub amount: BigDecimal,
    pub token_symbol: String,
    pub target_amount: BigDecimal,
    pub rescale_dust: BigDecimal,
    pub payload_hash: String,
}

/// A source-chain deposit as reported by a chain watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub bridge_id: i64,
    pub source_tx_hash: String,
    pub source_address: String,
    pub target_address: String,
    pub amount: BigDecimal,
    pub token_symbol: String,
    #[serde(default)]
    pub confirmations: u64,
}

// ============================================================================
// Collaborator messages
// ============================================================================

/// Broadcast to the snapshot roster when validation starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub transaction_id: i64,
    pub bridge_id: i64,
    pub payload_hash: String,
    pub source_tx_hash: String,
    pub source_address: String,
    pub target_address: String,
    pub amount: BigDecimal,
    pub token_symbol: String,
    pub quorum_threshold: i32,
    pub validators: Vec<i64>,
}

impl AttestationRequest {
    pub fn for_transaction(tx: &BridgeTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            bridge_id: tx.bridge_id,
            payload_hash: tx.payload_hash.clone(),
            source_tx_hash: tx.source_tx_hash.clone(),
            source_address: tx.source_address.clone(),
            target_address: tx.target_address.clone(),
            amount: tx.amount.clone(),
            token_symbol: tx.token_symbol.clone(),
            quorum_threshold: tx.quorum_threshold.unwrap_or_default(),
            validators: tx.validator_roster.clone(),
        }
    }
}

/// Submitted to the target chain relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub transaction_id: i64,
    pub attempt_id: i64,
    pub target_network: ChainId,
    pub target_address: String,
    pub target_token_address: String,
    pub target_amount: BigDecimal,
    pub payload_hash: String,
    pub attestations: Vec<Attestation>,
}

/// Immediate answer from a target executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted for broadcast; the final result arrives via a watcher report
    Accepted,
    /// Executed synchronously
    Completed { target_tx_hash: String },
    /// Irrecoverably refused by the target chain
    Rejected { reason: String },
}

/// Final target-chain result reported by a watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { target_tx_hash: String },
    Rejected { reason: String },
    Transient { reason: String },
}

/// Compensating refund owed to the depositor after a revert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundObligation {
    pub transaction_id: i64,
    pub bridge_id: i64,
    pub source_tx_hash: String,
    pub refund_address: String,
    pub amount: BigDecimal,
    pub token_symbol: String,
    pub reason: String,
}

impl RefundObligation {
    pub fn for_transaction(tx: &BridgeTransaction, reason: &str) -> Self {
        Self {
            transaction_id: tx.id,
            bridge_id: tx.bridge_id,
            source_tx_hash: tx.source_tx_hash.clone(),
            refund_address: tx.source_address.clone(),
            amount: tx.amount.clone(),
            token_symbol: tx.token_symbol.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Emitted on every stored status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transaction_id: i64,
    pub bridge_id: i64,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}
