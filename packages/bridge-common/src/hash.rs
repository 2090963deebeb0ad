//! Canonical attestation payload hashing
//!
//! Validators sign the 32-byte keccak256 digest of a deposit's identifying fields. The
//! coordinator, in-process signers and any out-of-process validator must compute the same
//! digest, so the encoding here is fixed:
//!
//! ```text
//! "bridge-attestation:v1" || bridge_id (i64 BE)
//!   || len || source_tx_hash || len || amount || len || source_address
//!   || len || target_address || len || token_symbol
//! ```
//!
//! Every variable-length field is prefixed with its byte length as a big-endian `u32`, so
//! no two distinct field tuples share an encoding. `amount` is the normalized plain decimal
//! string in source base units (`"50000000"`, never `"5E+7"`).

use bigdecimal::BigDecimal;
use tiny_keccak::{Hasher, Keccak};

const DOMAIN_TAG: &[u8] = b"bridge-attestation:v1";
const HEARTBEAT_TAG: &[u8] = b"bridge-heartbeat:v1";

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Fields covered by a validator attestation
#[derive(Debug, Clone, Copy)]
pub struct PayloadFields<'a> {
    pub bridge_id: i64,
    pub source_tx_hash: &'a str,
    pub amount: &'a BigDecimal,
    pub source_address: &'a str,
    pub target_address: &'a str,
    pub token_symbol: &'a str,
}

/// Render an amount the same way regardless of the scale it was parsed with
pub fn canonical_amount(amount: &BigDecimal) -> String {
    amount.normalized().to_plain_string()
}

fn push_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    buf.extend_from_slice(field);
}

/// Compute the digest validators sign for a deposit
pub fn compute_payload_hash(fields: &PayloadFields<'_>) -> [u8; 32] {
    let amount = canonical_amount(fields.amount);

    let mut data = Vec::with_capacity(
        DOMAIN_TAG.len()
            + 8
            + 20
            + fields.source_tx_hash.len()
            + amount.len()
            + fields.source_address.len()
            + fields.target_address.len()
            + fields.token_symbol.len(),
    );
    data.extend_from_slice(DOMAIN_TAG);
    data.extend_from_slice(&fields.bridge_id.to_be_bytes());
    push_field(&mut data, fields.source_tx_hash.as_bytes());
    push_field(&mut data, amount.as_bytes());
    push_field(&mut data, fields.source_address.as_bytes());
    push_field(&mut data, fields.target_address.as_bytes());
    push_field(&mut data, fields.token_symbol.as_bytes());

    keccak256(&data)
}

/// Digest a validator signs to prove a heartbeat (unix seconds) came from its key
pub fn compute_heartbeat_hash(validator_id: i64, timestamp: i64) -> [u8; 32] {
    let mut data = Vec::with_capacity(HEARTBEAT_TAG.len() + 16);
    data.extend_from_slice(HEARTBEAT_TAG);
    data.extend_from_slice(&validator_id.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    keccak256(&data)
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 32-byte hex string (with or without 0x prefix)
pub fn bytes32_from_hex(s: &str) -> Result<[u8; 32], String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex '{}': {}", s, e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))
}
