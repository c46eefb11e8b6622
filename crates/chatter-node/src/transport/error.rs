//! Transport error types.

use std::fmt;

/// Reason code attached to every [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The address could not be parsed as `host:port`.
    InvalidAddress,
    /// The proxy endpoint could not be reached.
    ProxyUnreachable,
    /// The proxy answered but refused the request or spoke an unexpected protocol.
    ProxyRejected,
    /// The peer could not be reached, directly or through the proxy.
    TargetUnreachable,
    Timeout,
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidAddress => "invalid address",
            Self::ProxyUnreachable => "proxy unreachable",
            Self::ProxyRejected => "proxy rejected",
            Self::TargetUnreachable => "target unreachable",
            Self::Timeout => "timeout",
            Self::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// Connection failure surfaced uniformly by the transport adapter.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::new(TransportErrorKind::Io, e.to_string())
    }
}
