//! P2P Chatter node.
//!
//! Two peers that share a secret agree on a session key without a server,
//! then exchange sealed, strictly ordered frames over a direct or proxied
//! stream. On top of that channel sit chat messages and password-protected
//! file objects.
//!
//! - [`transport`]: direct TCP or SOCKS5-proxied byte streams
//! - [`wire`]: length-prefixed message framing
//! - [`session`]: key exchange, session state machine and dispatch
//! - [`files`]: encrypted file objects with expiry and recipient lists

pub mod files;
pub mod session;
pub mod transport;
pub mod wire;
