//! Common types for cross-chain operations
//!
//! This module provides the identifiers and status enums shared by the coordinator
//! library, its storage layer and its HTTP surface. All status strings use one canonical
//! SCREAMING_SNAKE_CASE spelling for storage and JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Chain ID (4 bytes)
// ============================================================================

/// Represents a 4-byte network identifier
///
/// Networks are identified by a 4-byte ID assigned when a bridge is configured.
/// Serialized as a plain integer in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct ChainId(pub [u8; 4]);

impl ChainId {
    /// Create from u32
    pub fn from_u32(id: u32) -> Self {
        ChainId(id.to_be_bytes())
    }

    /// Convert to u32
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Create from hex string (with or without 0x prefix)
    pub fn from_hex(hex: &str) -> Result<Self, ParseChainIdError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex).map_err(|_| ParseChainIdError(hex.to_string()))?;
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| ParseChainIdError(hex.to_string()))?;
        Ok(ChainId(bytes))
    }

    /// Convert to hex string with 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u32())
    }
}

impl From<u32> for ChainId {
    fn from(id: u32) -> Self {
        ChainId::from_u32(id)
    }
}

impl From<ChainId> for u32 {
    fn from(id: ChainId) -> Self {
        id.to_u32()
    }
}

impl From<[u8; 4]> for ChainId {
    fn from(bytes: [u8; 4]) -> Self {
        ChainId(bytes)
    }
}

/// Accepts `0x`-prefixed 4-byte hex or a decimal integer
impl FromStr for ChainId {
    type Err = ParseChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("0x") {
            return ChainId::from_hex(s);
        }
        s.parse::<u32>()
            .map(ChainId::from_u32)
            .map_err(|_| ParseChainIdError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid chain id: {0}")]
pub struct ParseChainIdError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} status: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

// ============================================================================
// Bridge status
// ============================================================================

/// Operational status of a bridge configuration
///
/// Only `Active` bridges accept new deposits. Transactions already in flight on a bridge
/// moved to `Maintenance` or `Deprecated` still run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStatus {
    Active,
    Inactive,
    Maintenance,
    Deprecated,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Active => "ACTIVE",
            BridgeStatus::Inactive => "INACTIVE",
            BridgeStatus::Maintenance => "MAINTENANCE",
            BridgeStatus::Deprecated => "DEPRECATED",
        }
    }

    pub fn accepts_deposits(&self) -> bool {
        matches!(self, BridgeStatus::Active)
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BridgeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(BridgeStatus::Active),
            "INACTIVE" => Ok(BridgeStatus::Inactive),
            "MAINTENANCE" => Ok(BridgeStatus::Maintenance),
            "DEPRECATED" => Ok(BridgeStatus::Deprecated),
            _ => Err(ParseStatusError {
                kind: "bridge",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Validator status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidatorStatus {
    Pending,
    Active,
    Suspended,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::Pending => "PENDING",
            ValidatorStatus::Active => "ACTIVE",
            ValidatorStatus::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ValidatorStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ValidatorStatus::Pending),
            "ACTIVE" => Ok(ValidatorStatus::Active),
            "SUSPENDED" => Ok(ValidatorStatus::Suspended),
            _ => Err(ParseStatusError {
                kind: "validator",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Transaction status (state machine)
// ============================================================================

/// Bridge transaction lifecycle
///
/// ```text
/// INITIATED -> PENDING_SOURCE_CONFIRMATION -> SOURCE_CONFIRMED -> PENDING_VALIDATION
///   -> VALIDATED -> PENDING_TARGET_EXECUTION -> COMPLETED
/// ```
///
/// `FAILED` is reachable from every non-terminal state, `REVERTED` only from
/// `VALIDATED` and `PENDING_TARGET_EXECUTION`. `COMPLETED`, `FAILED` and `REVERTED` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    PendingSourceConfirmation,
    SourceConfirmed,
    PendingValidation,
    Validated,
    PendingTargetExecution,
    Completed,
    Failed,
    Reverted,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 9] = [
        TransactionStatus::Initiated,
        TransactionStatus::PendingSourceConfirmation,
        TransactionStatus::SourceConfirmed,
        TransactionStatus::PendingValidation,
        TransactionStatus::Validated,
        TransactionStatus::PendingTargetExecution,
        TransactionStatus::Completed,
        TransactionStatus::Failed,
        TransactionStatus::Reverted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "INITIATED",
            TransactionStatus::PendingSourceConfirmation => "PENDING_SOURCE_CONFIRMATION",
            TransactionStatus::SourceConfirmed => "SOURCE_CONFIRMED",
            TransactionStatus::PendingValidation => "PENDING_VALIDATION",
            TransactionStatus::Validated => "VALIDATED",
            TransactionStatus::PendingTargetExecution => "PENDING_TARGET_EXECUTION",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Reverted => "REVERTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Reverted
        )
    }

    /// Whether the transaction may still be cancelled (no validator or chain commitment yet)
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Initiated | TransactionStatus::PendingSourceConfirmation
        )
    }

    /// Transition table. Same-state updates are not transitions and return false.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Initiated, PendingSourceConfirmation)
                | (PendingSourceConfirmation, SourceConfirmed)
                | (SourceConfirmed, PendingValidation)
                | (PendingValidation, Validated)
                | (Validated, PendingTargetExecution)
                | (Validated, Reverted)
                | (PendingTargetExecution, Completed)
                | (PendingTargetExecution, Reverted)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| ParseStatusError {
                kind: "transaction",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_from_u32() {
        let id = ChainId::from_u32(1);
        assert_eq!(id.to_u32(), 1);
        assert_eq!(id.0, [0, 0, 0, 1]);
    }

    #[test]
    fn test_chain_id_from_str() {
        assert_eq!("0x00000100".parse::<ChainId>().unwrap().to_u32(), 256);
        assert_eq!("137".parse::<ChainId>().unwrap().to_u32(), 137);
        assert!("0x0100".parse::<ChainId>().is_err());
        assert!("polygon".parse::<ChainId>().is_err());
    }

    #[test]
    fn test_chain_id_json_is_integer() {
        let json = serde_json::to_string(&ChainId::from_u32(56)).unwrap();
        assert_eq!(json, "56");
        let back: ChainId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChainId::from_u32(56));
    }

    #[test]
    fn test_status_strings_are_canonical() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::PendingTargetExecution).unwrap(),
            "\"PENDING_TARGET_EXECUTION\""
        );
        assert_eq!(BridgeStatus::Maintenance.as_str(), "MAINTENANCE");
        assert_eq!(ValidatorStatus::Suspended.to_string(), "SUSPENDED");
        // Lowercase spellings from older rows still parse
        assert_eq!("active".parse::<BridgeStatus>().unwrap(), BridgeStatus::Active);
        assert_eq!(
            "pending_validation".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::PendingValidation
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        use TransactionStatus::*;
        let path = [
            Initiated,
            PendingSourceConfirmation,
            SourceConfirmed,
            PendingValidation,
            Validated,
            PendingTargetExecution,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        for status in TransactionStatus::ALL {
            assert_eq!(
                status.can_transition_to(TransactionStatus::Failed),
                !status.is_terminal()
            );
        }
    }

    #[test]
    fn test_reverted_only_after_validation() {
        use TransactionStatus::*;
        assert!(Validated.can_transition_to(Reverted));
        assert!(PendingTargetExecution.can_transition_to(Reverted));
        assert!(!PendingValidation.can_transition_to(Reverted));
        assert!(!SourceConfirmed.can_transition_to(Reverted));
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        use TransactionStatus::*;
        for terminal in [Completed, Failed, Reverted] {
            for next in TransactionStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_no_skipping_steps() {
        use TransactionStatus::*;
        assert!(!Initiated.can_transition_to(SourceConfirmed));
        assert!(!SourceConfirmed.can_transition_to(Validated));
        assert!(!PendingValidation.can_transition_to(PendingTargetExecution));
        assert!(!Validated.can_transition_to(Completed));
    }

    #[test]
    fn test_cancellable_states() {
        use TransactionStatus::*;
        assert!(Initiated.is_cancellable());
        assert!(PendingSourceConfirmation.is_cancellable());
        assert!(!SourceConfirmed.is_cancellable());
        assert!(!PendingValidation.is_cancellable());
    }
}
