//! Shared secrets ("share passwords").
//!
//! A shared secret is relayed between the two users out of band and only
//! ever feeds the memory-hard KDF. It is never written to the wire.

use rand::Rng;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Characters used for generated share passwords.
const SHARE_PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Length of generated share passwords.
pub const SHARE_PASSWORD_LEN: usize = 16;

/// Below this length a secret is accepted but reported as weak.
pub const RECOMMENDED_SECRET_LEN: usize = 8;

/// An out-of-band password, wiped from memory on drop.
pub struct SharedSecret(Zeroizing<String>);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// Generate a random share password from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let secret: String = (0..SHARE_PASSWORD_LEN)
            .map(|_| {
                let i = rng.gen_range(0..SHARE_PASSWORD_CHARSET.len());
                char::from(SHARE_PASSWORD_CHARSET[i])
            })
            .collect();
        Self::new(secret)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Reveal the secret, e.g. to show it to the user once.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_weak(&self) -> bool {
        self.0.chars().count() < RECOMMENDED_SECRET_LEN
    }
}

impl From<&str> for SharedSecret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
