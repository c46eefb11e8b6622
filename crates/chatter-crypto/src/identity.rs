//! Local identity management.
//!
//! An identity is a display username, an X25519 static keypair and an Ed25519
//! signing keypair. All of it lives only in process memory; keys can be
//! exported explicitly through their `secret_bytes` methods.

use std::time::SystemTime;

use rand::Rng;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::signing::SigningKeyPair;

/// Prefix every generated username carries.
pub const USERNAME_PREFIX: &str = "P2P-";

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 32;

const ADJECTIVES: [&str; 20] = [
    "Laughing", "Speedy", "Sneaky", "Bright", "Silent", "Clever", "Happy", "Funky", "Spicy",
    "Tiny", "Jumpy", "Wild", "Crazy", "Groovy", "Swift", "Sly", "Bold", "Daring", "Witty",
    "Quirky",
];

const NOUNS: [&str; 20] = [
    "Llama", "Tiger", "Panda", "Raccoon", "Dolphin", "Phoenix", "Raven", "Owl", "Fox", "Wolf",
    "Badger", "Otter", "Eagle", "Hawk", "Crypto", "Ghost", "Phantom", "Shadow", "Ninja", "Wizard",
];

/// An X25519 static keypair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Export the secret key as raw bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Compute a human-readable hex fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }
}

/// The local ephemeral identity.
#[derive(Debug, Clone)]
pub struct Identity {
    username: String,
    keypair: IdentityKeyPair,
    signing: SigningKeyPair,
    created_at: SystemTime,
}

impl Identity {
    /// Generate a fresh username and keypair.
    ///
    /// Usernames are cosmetic and may collide with another peer's; callers
    /// that care regenerate with [`Identity::rotate_username`].
    pub fn generate() -> Self {
        Self {
            username: generate_username(),
            keypair: IdentityKeyPair::generate(),
            signing: SigningKeyPair::generate(),
            created_at: SystemTime::now(),
        }
    }

    /// Fresh keypair under a caller-chosen username.
    pub fn with_username(username: impl Into<String>) -> Result<Self, CryptoError> {
        let username = username.into();
        validate_username(&username)?;
        Ok(Self {
            username,
            keypair: IdentityKeyPair::generate(),
            signing: SigningKeyPair::generate(),
            created_at: SystemTime::now(),
        })
    }

    /// Replace the username with a newly generated one, keeping the keypair.
    pub fn rotate_username(&mut self) -> &str {
        let mut next = generate_username();
        while next == self.username {
            next = generate_username();
        }
        self.username = next;
        &self.username
    }

    /// Replace the username with `username`, keeping the keypair.
    pub fn rename(&mut self, username: impl Into<String>) -> Result<(), CryptoError> {
        let username = username.into();
        validate_username(&username)?;
        self.username = username;
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub const fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }

    /// Key used for optional message signatures.
    pub const fn signing_keys(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn fingerprint(&self) -> String {
        self.keypair.fingerprint()
    }
}

/// Produce a `P2P-<Adjective><Noun><0-999>` username.
///
/// The suffix is cosmetic, so the thread RNG is used here; key material
/// always comes from the OS CSPRNG.
pub fn generate_username() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u16 = rng.gen_range(0..1000);
    format!("{USERNAME_PREFIX}{adjective}{noun}{suffix}")
}

/// Check length (3-32) and charset (ASCII alphanumerics, `-`, `_`).
pub fn validate_username(username: &str) -> Result<(), CryptoError> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(CryptoError::InvalidUsername(format!(
            "length {len} outside {MIN_USERNAME_LEN}..={MAX_USERNAME_LEN}"
        )));
    }
    if let Some(c) = username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(CryptoError::InvalidUsername(format!(
            "unsupported character {c:?}"
        )));
    }
    Ok(())
}

/// Compute a colon-separated hex fingerprint from raw public key bytes.
pub fn fingerprint_of(pubkey_bytes: &[u8; 32]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(pubkey_bytes);
    hash.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
