//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// AEAD tag or key-confirmation tag did not verify.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Frame out of order: expected sequence {expected}, got {actual}")]
    ReplayOrOutOfOrder { expected: u64, actual: u64 },

    /// A handshake message carried bytes that are not a valid group element.
    #[error("Malformed handshake value: {0}")]
    MalformedHandshake(&'static str),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Sequence counter exhausted - session must be re-established")]
    SequenceExhausted,
}
