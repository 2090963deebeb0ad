//! Bridge-Common: shared types for the bridge coordinator
//!
//! This crate provides the pieces that every part of the coordinator (and any external
//! watcher or validator written in Rust) has to agree on byte-for-byte:
//!
//! - **Types** - `ChainId`, bridge/validator/transaction status enums and the transaction
//!   state machine transition table
//! - **Hash Computation** - canonical attestation payload hashing (keccak256)
//! - **Amounts** - arbitrary-precision decimal parsing and cross-chain rescale
//! - **Redaction** - wrapper that keeps secrets out of logs
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! bridge-common = { path = "../bridge-common" }
//! ```

pub mod amount;
pub mod hash;
pub mod redact;
pub mod types;

pub use amount::{parse_amount, rescale, unscale, AmountError, Rescaled, MAX_DECIMALS};
pub use hash::{
    bytes32_from_hex, bytes32_to_hex, canonical_amount, compute_heartbeat_hash, compute_payload_hash,
    keccak256, PayloadFields,
};
pub use redact::Redacted;
pub use types::{
    BridgeStatus, ChainId, ParseChainIdError, ParseStatusError, TransactionStatus, ValidatorStatus,
};
