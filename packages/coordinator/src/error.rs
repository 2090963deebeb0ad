//! Error types for the bridge coordinator
//!
//! `BridgeError` is what every registry and coordinator operation returns. The HTTP layer
//! maps its variants onto status codes via [`BridgeError::http_status`].

use bigdecimal::BigDecimal;
use bridge_common::{AmountError, BridgeStatus, TransactionStatus};
use thiserror::Error;

/// Rejected before anything is persisted (bad configuration or an unacceptable deposit)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("bridge {bridge_id} is not accepting deposits (status {status})")]
    BridgeNotActive { bridge_id: i64, status: BridgeStatus },

    #[error("token {symbol} is not supported on bridge {bridge_id}")]
    TokenNotSupported { bridge_id: i64, symbol: String },

    #[error("token {symbol} is disabled on bridge {bridge_id}")]
    TokenDisabled { bridge_id: i64, symbol: String },

    #[error("amount {amount} outside bridge limits [{min}, {max}]")]
    AmountOutOfRange {
        amount: BigDecimal,
        min: BigDecimal,
        max: BigDecimal,
    },

    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("threshold {threshold} exceeds {eligible} eligible active validators")]
    ThresholdExceedsValidators { threshold: i32, eligible: usize },

    #[error("invalid bridge configuration: {0}")]
    InvalidBridge(String),

    #[error("invalid token configuration: {0}")]
    InvalidToken(String),

    #[error("invalid validator: {0}")]
    InvalidValidator(String),

    #[error("invalid deposit: {0}")]
    InvalidDeposit(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("bridge {bridge_id} is deprecated")]
    BridgeDeprecated { bridge_id: i64 },

    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// Integrity violations detected at ingestion. Never mutate the transaction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    #[error("source tx {source_tx_hash} already reported on bridge {bridge_id} with different fields")]
    DuplicateSourceTx {
        bridge_id: i64,
        source_tx_hash: String,
    },

    #[error("invalid signature from validator {validator_id}: {reason}")]
    InvalidSignature { validator_id: i64, reason: String },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("heartbeat from validator {validator_id} at {timestamp} is stale or outside the accepted window")]
    StaleHeartbeat { validator_id: i64, timestamp: i64 },
}

/// Retryable conditions. The transaction stays in its current state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransientError {
    #[error("only {eligible} eligible validators for threshold {threshold}")]
    InsufficientValidators { eligible: usize, threshold: i32 },

    #[error("external call timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Quorum could not be reached in time
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuorumError {
    #[error("validation_timeout")]
    ValidationWindowExpired,
}

/// Target chain outcome that ends the transaction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("target rejected execution: {0}")]
    Rejected(String),

    #[error("execution_retries_exhausted")]
    RetriesExhausted,
}

/// Persistence failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Backend(String),
}

/// Signature scheme failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature does not verify")]
    Mismatch,

    #[error("no signing key loaded")]
    KeyUnavailable,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Transient(#[from] TransientError),

    #[error(transparent)]
    Quorum(#[from] QuorumError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("transaction {id} is in terminal state {status}")]
    TerminalState { id: i64, status: TransactionStatus },

    #[error("validator {validator_id} is not eligible: {reason}")]
    NotEligible { validator_id: i64, reason: String },

    /// Compare-and-set lost to a concurrent writer
    #[error("transaction {id} changed concurrently (now {current})")]
    Conflict { id: i64, current: TransactionStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BridgeError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BridgeError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status code for the API layer
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Config(_) => 400,
            BridgeError::Integrity(IntegrityError::InvalidSignature { .. }) => 422,
            BridgeError::Integrity(_) => 409,
            BridgeError::NotFound { .. } => 404,
            BridgeError::NotEligible { .. } => 403,
            BridgeError::InvalidTransition { .. }
            | BridgeError::TerminalState { .. }
            | BridgeError::Conflict { .. } => 409,
            BridgeError::Transient(_) => 503,
            BridgeError::Quorum(_) | BridgeError::Execution(_) => 409,
            BridgeError::Store(StoreError::UniqueViolation(_)) => 409,
            BridgeError::Store(_) => 500,
        }
    }

    /// Short machine-readable code for JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config_error",
            BridgeError::Integrity(_) => "integrity_error",
            BridgeError::Transient(_) => "transient_error",
            BridgeError::Quorum(_) => "quorum_error",
            BridgeError::Execution(_) => "execution_error",
            BridgeError::NotFound { .. } => "not_found",
            BridgeError::InvalidTransition { .. } => "invalid_transition",
            BridgeError::TerminalState { .. } => "terminal_state",
            BridgeError::NotEligible { .. } => "not_eligible",
            BridgeError::Conflict { .. } => "conflict",
            BridgeError::Store(_) => "store_error",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
