//! Peer sessions: key exchange, secure channel lifecycle and the message
//! dispatch running on top of it.

mod error;
mod handshake;
mod peer;
mod types;
mod writer;

pub use error::SessionError;
pub use peer::{PeerSession, SessionOptions};
pub use types::{ErrorKind, RemoteFile, SessionEvent, SessionState, SignatureStatus};
