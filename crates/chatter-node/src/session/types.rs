//! Session states, events and error kinds.

use std::fmt;

use crate::files::FileMetadata;

/// Failure taxonomy shared by every session-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure. Retryable by reconnecting.
    NetworkError,
    /// Key exchange did not finish in time. Retryable from scratch.
    HandshakeTimeout,
    /// Wrong shared secret, tampering, or a channel frame that failed verification.
    AuthenticationFailed,
    ProtocolViolation,
    ReplayOrOutOfOrder,
    AlreadyConnected,
    InvalidState,
    Cancelled,
    NotFound,
    Expired,
    WrongPassword,
    AccessDenied,
    /// Caller-supplied value rejected before anything was sent.
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// Whether the caller may retry with the same key material.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkError | Self::HandshakeTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    KeyExchange,
    Established,
    Closing,
    Closed,
    Failed(ErrorKind),
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// A new connect/accept may start from here.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "Failed({kind})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Outcome of checking a received message's optional signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Unsigned,
    /// Valid signature by the key with this fingerprint.
    Verified { fingerprint: String },
    /// A signature was attached but does not verify.
    Invalid,
}

impl SignatureStatus {
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Notifications for whatever front end is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    MessageReceived {
        body: String,
        sender: String,
        timestamp_ms: u64,
        signature: SignatureStatus,
    },
    /// A peer offered a file object; only metadata is exposed.
    FileObjectAvailable(FileMetadata),
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

/// File contents returned by the peer for a remote request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: String,
    pub name: String,
    pub checksum: String,
    pub payload: Vec<u8>,
}
