//! Memory-hard password key derivation (Argon2id).
//!
//! Used for both the key-exchange blinding scalar and file object keys, so a
//! guessed password always costs a full Argon2id evaluation.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Length of freshly generated salts.
pub const SALT_LEN: usize = 16;

/// Argon2id cost parameters. Stored next to every file object so it can be
/// re-derived later even if defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// The argon2 crate's recommended defaults (19 MiB, t=2, p=1).
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    /// Minimal parameters to keep test suites fast.
    #[cfg(any(test, feature = "test-utils"))]
    pub const fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn hasher(self, output_len: usize) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(output_len),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derive `out.len()` bytes from `password` and `salt`.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: KdfParams,
    out: &mut [u8],
) -> Result<(), CryptoError> {
    params
        .hasher(out.len())?
        .hash_password_into(password, salt, out)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
}

/// Fresh random salt. Salts are not secret.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
