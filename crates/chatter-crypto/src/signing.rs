//! Ed25519 message signatures.
//!
//! The signing key is separate from the X25519 identity key. It lives only in
//! process memory and is regenerated with every identity.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::CryptoError;
use crate::identity::fingerprint_of;

pub const SIGNATURE_LEN: usize = 64;
pub const VERIFYING_KEY_LEN: usize = 32;

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("verifying", &hex::encode(self.verifying_bytes()))
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a raw 32-byte signing key.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: &[u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(secret),
        })
    }

    /// Export the signing key. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn verifying_bytes(&self) -> [u8; VERIFYING_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Colon-hex SHA-256 of the verifying key, for out-of-band comparison.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.verifying_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Check `signature` over `message` against a raw verifying key.
///
/// Uses strict verification, so small-order keys and malleated signatures
/// are rejected.
pub fn verify_signature(
    verifying_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key: &[u8; VERIFYING_KEY_LEN] =
        verifying_key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: VERIFYING_KEY_LEN,
            actual: verifying_key.len(),
        })?;
    let key = VerifyingKey::from_bytes(key).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
}
