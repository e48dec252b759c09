//! Ed25519 keypair wrapper.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid secret key length: {0} (expected 32)")]
    InvalidLength(usize),
}

/// An ed25519 signing keypair.
pub struct SigningKeypair {
    pub signing_key: SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct a keypair from a stored secret. Rejects anything that
    /// is not exactly 32 bytes, so callers reading key files do not need
    /// their own length checks.
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| KeyError::InvalidLength(secret.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// The 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The 32-byte secret key.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}
