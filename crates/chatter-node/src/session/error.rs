//! Session error type.

use std::time::Duration;

use chatter_crypto::CryptoError;

use crate::files::FileError;
use crate::transport::TransportError;
use crate::wire::WireError;

use super::types::{ErrorKind, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A session is already in progress (state: {0})")]
    AlreadyConnected(SessionState),

    #[error("Operation not allowed in state {0}")]
    InvalidState(SessionState),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame out of order: expected sequence {expected}, got {actual}")]
    ReplayOrOutOfOrder { expected: u64, actual: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Access denied by peer")]
    AccessDenied,

    #[error("Message of {len} bytes exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    File(#[from] FileError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Map onto the session failure taxonomy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Transport(_) | Self::Network(_) => ErrorKind::NetworkError,
            Self::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::ReplayOrOutOfOrder { .. } => ErrorKind::ReplayOrOutOfOrder,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AccessDenied | Self::File(FileError::NotRecipient) => ErrorKind::AccessDenied,
            Self::TooLarge { .. }
            | Self::Crypto(CryptoError::InvalidUsername(_))
            | Self::File(
                FileError::EmptyName
                | FileError::EmptyPayload
                | FileError::PasswordTooShort { .. }
                | FileError::AlreadyExists(_)
                | FileError::InvalidObject(_)
                | FileError::QuotaExceeded(_)
                | FileError::Serialization(_),
            ) => ErrorKind::InvalidInput,
            Self::File(FileError::NotFound(_)) => ErrorKind::NotFound,
            Self::File(FileError::Expired(_)) => ErrorKind::Expired,
            Self::File(FileError::WrongPassword) => ErrorKind::WrongPassword,
            Self::File(
                FileError::ChecksumMismatch(_) | FileError::Crypto(_) | FileError::Task(_),
            )
            | Self::Crypto(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors that end an established session.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TooLarge { .. } | Self::File(_) | Self::AccessDenied | Self::InvalidState(_)
        )
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed,
            CryptoError::ReplayOrOutOfOrder { expected, actual } => {
                Self::ReplayOrOutOfOrder { expected, actual }
            }
            CryptoError::MalformedHandshake(what) => {
                Self::ProtocolViolation(format!("malformed handshake value: {what}"))
            }
            other => Self::Crypto(other),
        }
    }
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => Self::Network(e.to_string()),
            WireError::Closed => Self::Network("connection closed by peer".into()),
            other @ (WireError::TooLarge { .. }
            | WireError::UnsupportedVersion(_)
            | WireError::UnknownKind(_)
            | WireError::Malformed(_)) => Self::ProtocolViolation(other.to_string()),
        }
    }
}
