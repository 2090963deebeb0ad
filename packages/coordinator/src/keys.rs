//! Attestation key management and signature verification
//!
//! [`KeyManager`] owns one secp256k1 signing key with an explicit lifecycle:
//! `init` (generate or load) → `rotate` (replace, bumping the version) → `teardown` (drop).
//! It is passed to whatever needs to sign; nothing holds a key globally.
//!
//! Verification is behind [`SignatureVerifier`] so the coordinator does not depend on one
//! scheme. [`EcdsaVerifier`] expects:
//! - public key: SEC1 compressed (33 bytes) or uncompressed (65 bytes), hex
//! - signature: 64-byte `r || s`, hex, over the 32-byte payload hash (no further hashing)

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::SignatureError;

fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.trim().strip_prefix("0x").unwrap_or(s.trim()))
}

/// Checks attestation signatures against a validator's registered public key
pub trait SignatureVerifier: Send + Sync {
    /// Reject keys that can never verify anything
    fn validate_public_key(&self, public_key: &str) -> Result<(), SignatureError>;

    fn verify(
        &self,
        public_key: &str,
        payload_hash: &[u8; 32],
        signature: &str,
    ) -> Result<(), SignatureError>;
}

/// secp256k1 ECDSA over the raw payload hash
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdsaVerifier;

impl EcdsaVerifier {
    fn parse_key(public_key: &str) -> Result<VerifyingKey, SignatureError> {
        let bytes =
            decode_hex(public_key).map_err(|e| SignatureError::MalformedPublicKey(e.to_string()))?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| SignatureError::MalformedPublicKey(e.to_string()))
    }
}

impl SignatureVerifier for EcdsaVerifier {
    fn validate_public_key(&self, public_key: &str) -> Result<(), SignatureError> {
        Self::parse_key(public_key).map(|_| ())
    }

    fn verify(
        &self,
        public_key: &str,
        payload_hash: &[u8; 32],
        signature: &str,
    ) -> Result<(), SignatureError> {
        let key = Self::parse_key(public_key)?;
        let bytes =
            decode_hex(signature).map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
        key.verify_prehash(payload_hash, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Holds the signing key for an in-process validator
pub struct KeyManager {
    signing_key: Option<SigningKey>,
    version: u32,
}

/// Never print key material
impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("public_key", &self.public_key_hex().ok())
            .field("version", &self.version)
            .finish()
    }
}

impl KeyManager {
    /// Load a key from 32-byte hex, or generate one when `secret_hex` is `None`
    pub fn init(secret_hex: Option<&str>) -> Result<Self, SignatureError> {
        let signing_key = match secret_hex {
            Some(secret) => {
                let bytes = decode_hex(secret)
                    .map_err(|e| SignatureError::MalformedPublicKey(format!("secret key: {}", e)))?;
                SigningKey::from_slice(&bytes)
                    .map_err(|e| SignatureError::MalformedPublicKey(format!("secret key: {}", e)))?
            }
            None => SigningKey::random(&mut OsRng),
        };
        Ok(Self {
            signing_key: Some(signing_key),
            version: 1,
        })
    }

    pub fn generate() -> Self {
        Self {
            signing_key: Some(SigningKey::random(&mut OsRng)),
            version: 1,
        }
    }

    fn key(&self) -> Result<&SigningKey, SignatureError> {
        self.signing_key.as_ref().ok_or(SignatureError::KeyUnavailable)
    }

    /// SEC1 compressed public key, hex without prefix
    pub fn public_key_hex(&self) -> Result<String, SignatureError> {
        let key = self.key()?;
        let point = VerifyingKey::from(key).to_encoded_point(true);
        Ok(hex::encode(point.as_bytes()))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_active(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Sign a payload hash, returning 64-byte `r || s` hex
    pub fn sign(&self, payload_hash: &[u8; 32]) -> Result<String, SignatureError> {
        let signature: Signature = self
            .key()?
            .sign_prehash(payload_hash)
            .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Replace the key with a fresh one and return the new public key
    pub fn rotate(&mut self) -> Result<String, SignatureError> {
        self.key()?;
        self.signing_key = Some(SigningKey::random(&mut OsRng));
        self.version += 1;
        self.public_key_hex()
    }

    /// Drop the key; k256 zeroizes it on drop
    pub fn teardown(&mut self) {
        self.signing_key = None;
    }
}
