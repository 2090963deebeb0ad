use bigdecimal::BigDecimal;
use bridge_common::ChainId;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::{
    Attestation, Bridge, BridgeTransaction, RejectedAttestation, SupportedToken, Validator,
};

// Note: amounts are read as String. Every SELECT casts NUMERIC columns with `::TEXT` and
// every INSERT/UPDATE casts the bound text back with `$n::NUMERIC`. Statuses are stored as
// their canonical SCREAMING_SNAKE_CASE strings and parsed on the way out.

fn decimal(column: &str, value: &str) -> Result<BigDecimal, StoreError> {
    BigDecimal::from_str(value)
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", column, value, e)))
}

fn status<T: FromStr>(value: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

fn chain_id(value: i64) -> Result<ChainId, StoreError> {
    u32::try_from(value)
        .map(ChainId::from_u32)
        .map_err(|_| StoreError::Corrupt(format!("chain id {} out of range", value)))
}

fn decimals(value: i16) -> Result<u8, StoreError> {
    u8::try_from(value).map_err(|_| StoreError::Corrupt(format!("decimals {} out of range", value)))
}

#[derive(Debug, Clone, FromRow)]
pub struct BridgeRow {
    pub id: i64,
    pub source_network: i64,
    pub target_network: i64,
    pub status: String,
    pub validator_threshold: i32,
    pub fee: String,
    pub min_amount: String,
    pub max_amount: String,
    pub required_confirmations: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BridgeRow> for Bridge {
    type Error = StoreError;

    fn try_from(row: BridgeRow) -> Result<Self, Self::Error> {
        Ok(Bridge {
            id: row.id,
            source_network: chain_id(row.source_network)?,
            target_network: chain_id(row.target_network)?,
            status: status(&row.status)?,
            validator_threshold: row.validator_threshold,
            fee: decimal("fee", &row.fee)?,
            min_amount: decimal("min_amount", &row.min_amount)?,
            max_amount: decimal("max_amount", &row.max_amount)?,
            required_confirmations: row.required_confirmations,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ValidatorRow {
    pub id: i64,
    pub bridge_id: i64,
    pub address: String,
    pub public_key: String,
    pub status: String,
    pub reputation: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ValidatorRow> for Validator {
    type Error = StoreError;

    fn try_from(row: ValidatorRow) -> Result<Self, Self::Error> {
        Ok(Validator {
            id: row.id,
            bridge_id: row.bridge_id,
            address: row.address,
            public_key: row.public_key,
            status: status(&row.status)?,
            reputation: row.reputation,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub bridge_id: i64,
    pub symbol: String,
    pub source_token_address: String,
    pub target_token_address: String,
    pub source_decimals: i16,
    pub target_decimals: i16,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TokenRow> for SupportedToken {
    type Error = StoreError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(SupportedToken {
            bridge_id: row.bridge_id,
            symbol: row.symbol,
            source_token_address: row.source_token_address,
            target_token_address: row.target_token_address,
            source_decimals: decimals(row.source_decimals)?,
            target_decimals: decimals(row.target_decimals)?,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub bridge_id: i64,
    pub source_tx_hash: String,
    pub source_address: String,
    pub target_address: String,
    pub amount: String,
    pub token_symbol: String,
    pub target_amount: String,
    pub rescale_dust: String,
    pub status: String,
    pub confirmations: i64,
    pub payload_hash: String,
    pub quorum_threshold: Option<i32>,
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

impl TryFrom<TransactionRow> for BridgeTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(BridgeTransaction {
            id: row.id,
            bridge_id: row.bridge_id,
            source_tx_hash: row.source_tx_hash,
            source_address: row.source_address,
            target_address: row.target_address,
            amount: decimal("amount", &row.amount)?,
            token_symbol: row.token_symbol,
            target_amount: decimal("target_amount", &row.target_amount)?,
            rescale_dust: decimal("rescale_dust", &row.rescale_dust)?,
            status: status(&row.status)?,
            confirmations: row.confirmations,
            payload_hash: row.payload_hash,
            quorum_threshold: row.quorum_threshold,
            validator_roster: row.validator_roster,
            execution_attempt_id: row.execution_attempt_id,
            execution_retries: row.execution_retries,
            target_tx_hash: row.target_tx_hash,
            error_message: row.error_message,
            refund_required: row.refund_required,
            created_at: row.created_at,
            updated_at: row.updated_at,
            status_changed_at: row.status_changed_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AttestationRow {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

impl From<AttestationRow> for Attestation {
    fn from(row: AttestationRow) -> Self {
        Attestation {
            transaction_id: row.transaction_id,
            validator_id: row.validator_id,
            signature: row.signature,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RejectedAttestationRow {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl From<RejectedAttestationRow> for RejectedAttestation {
    fn from(row: RejectedAttestationRow) -> Self {
        RejectedAttestation {
            transaction_id: row.transaction_id,
            validator_id: row.validator_id,
            signature: row.signature,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}
