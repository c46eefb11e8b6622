//! File object store errors.

use chatter_crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("File object not found: {0}")]
    NotFound(String),

    #[error("File object expired: {0}")]
    Expired(String),

    #[error("Wrong password")]
    WrongPassword,

    #[error("Requester is not a recipient of this file object")]
    NotRecipient,

    #[error("File name must not be empty")]
    EmptyName,

    #[error("File payload must not be empty")]
    EmptyPayload,

    #[error("Password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("File object already exists: {0}")]
    AlreadyExists(String),

    /// Imported object failed structural validation.
    #[error("Invalid file object: {0}")]
    InvalidObject(String),

    /// The peer offered more than one session may hold.
    #[error("Offer limit reached: {0}")]
    QuotaExceeded(String),

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl FileError {
    /// Failures that a remote requester only ever sees as `AccessDenied`.
    pub const fn is_access_failure(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Expired(_) | Self::WrongPassword | Self::NotRecipient
        )
    }
}
