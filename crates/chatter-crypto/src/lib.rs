//! P2P Chatter crypto library.
//!
//! ## Crypto primitives
//!
//! - **Identity**: display username + X25519 static keypair, in memory only
//! - **Key exchange**: SPAKE2-style PAKE over Ristretto255, blinding scalar
//!   from Argon2id(shared secret)
//! - **Channel**: per-direction HKDF-SHA256 key chains, ChaCha20-Poly1305 AEAD,
//!   12-byte nonce (4-byte epoch + 8-byte sequence), strict in-order sequencing
//! - **KDF**: Argon2id for shared secrets and file passwords
//! - **Signing**: optional Ed25519 signatures over chat messages

pub mod channel;
pub mod credential;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod kdf;
pub mod signing;

/// Version byte bound into every channel frame's associated data.
pub const PROTOCOL_VERSION: u8 = 1;

#[cfg(any(test, feature = "test-utils"))]
pub use channel::test_channel_pair;
pub use channel::{
    FrameOpener, FrameSealer, NONCE_SIZE, RekeyPolicy, SecureChannel, SecureFrame, TAG_SIZE,
};
pub use credential::SharedSecret;
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::perform_key_exchange;
pub use exchange::{
    ClientFinish, ClientHello, EstablishedKeys, InitiatorHandshake, PendingConfirmation,
    ResponderHandshake, Role, ServerHello,
};
pub use identity::{
    Identity, IdentityKeyPair, fingerprint_of, generate_username, validate_username,
};
pub use kdf::{KdfParams, derive_key, generate_salt};
pub use signing::{SigningKeyPair, verify_signature};
