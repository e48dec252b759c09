//! Process-wide aggregate signer.
//!
//! One `Signer` is constructed at startup from the node's secret key and
//! shared read-only by every aggregator. It signs the finalized tuple
//! `(config_id, round_id, value, timestamp)` so peers can assemble a
//! multi-signature proof for the submitter.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, Verifier, VerifyingKey};
use thiserror::Error;

use crate::keys::SigningKeypair;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("signing key unavailable")]
    KeyUnavailable,
}

/// Canonical byte encoding of the signed aggregate tuple.
///
/// Big-endian `config_id (4) | round_id (4) | value (8) | unix millis (8)`.
/// Every node must produce identical bytes for identical tuples.
pub fn aggregate_signing_bytes(
    config_id: i32,
    round_id: i32,
    value: i64,
    timestamp: &DateTime<Utc>,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&config_id.to_be_bytes());
    bytes.extend_from_slice(&round_id.to_be_bytes());
    bytes.extend_from_slice(&value.to_be_bytes());
    bytes.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
    bytes
}

/// Shared read-only signer owning the node's private key.
pub struct Signer {
    keypair: SigningKeypair,
}

impl Signer {
    pub fn new(keypair: SigningKeypair) -> Self {
        Self { keypair }
    }

    /// The signer's 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    /// Sign a finalized aggregate tuple. The 64-byte signature becomes this
    /// node's contribution to the round's concatenated proof.
    pub fn sign_aggregate(
        &self,
        config_id: i32,
        round_id: i32,
        value: i64,
        timestamp: &DateTime<Utc>,
    ) -> Result<Vec<u8>, SignerError> {
        let payload = aggregate_signing_bytes(config_id, round_id, value, timestamp);
        let signature: Signature = self.keypair.signing_key.sign(&payload);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verify a single peer signature over an aggregate tuple.
    pub fn verify_aggregate(
        pubkey: &[u8; 32],
        config_id: i32,
        round_id: i32,
        value: i64,
        timestamp: &DateTime<Utc>,
        signature: &[u8],
    ) -> bool {
        let verifying_key = match VerifyingKey::from_bytes(pubkey) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig_bytes: [u8; 64] = match signature.try_into() {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let signature = Signature::from_bytes(&sig_bytes);
        let payload = aggregate_signing_bytes(config_id, round_id, value, timestamp);
        verifying_key.verify(&payload, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_aggregate_verifies() {
        let signer = Signer::new(SigningKeypair::generate());
        let now = Utc::now();

        let proof = signer.sign_aggregate(3, 12, 104, &now).unwrap();
        assert_eq!(proof.len(), 64);
        assert!(Signer::verify_aggregate(
            &signer.public_key_bytes(),
            3,
            12,
            104,
            &now,
            &proof
        ));
    }

    #[test]
    fn test_tampered_tuple_rejected() {
        let signer = Signer::new(SigningKeypair::generate());
        let now = Utc::now();

        let proof = signer.sign_aggregate(3, 12, 104, &now).unwrap();
        assert!(!Signer::verify_aggregate(
            &signer.public_key_bytes(),
            3,
            12,
            105,
            &now,
            &proof
        ));
        assert!(!Signer::verify_aggregate(
            &signer.public_key_bytes(),
            3,
            13,
            104,
            &now,
            &proof
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let signer = Signer::new(SigningKeypair::generate());
        let other = Signer::new(SigningKeypair::generate());
        let now = Utc::now();

        let proof = signer.sign_aggregate(3, 12, 104, &now).unwrap();
        assert!(!Signer::verify_aggregate(
            &other.public_key_bytes(),
            3,
            12,
            104,
            &now,
            &proof
        ));
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let signer = Signer::new(SigningKeypair::generate());
        let now = Utc::now();

        let proof = signer.sign_aggregate(3, 12, 104, &now).unwrap();
        assert!(!Signer::verify_aggregate(
            &signer.public_key_bytes(),
            3,
            12,
            104,
            &now,
            &proof[..32]
        ));
    }

    #[test]
    fn test_signing_bytes_are_canonical() {
        let now = Utc::now();
        let a = aggregate_signing_bytes(1, 2, 3, &now);
        let b = aggregate_signing_bytes(1, 2, 3, &now);
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
    }
}
