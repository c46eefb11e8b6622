//! Application payloads carried inside sealed frames.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::files::FileObject;

use super::codec::{WireError, bincode_options};

/// Domain label prefixed to every signed chat message.
const TEXT_SIGNATURE_CONTEXT: &[u8] = b"p2p-chatter text signature v1";

/// Ed25519 signature over a chat message, with the key that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    pub verifying_key: [u8; 32],
    /// 64 bytes. Length is checked on verification.
    pub signature: Vec<u8>,
}

/// Bytes a chat message signature covers: a context label, the sender's
/// username, the send time and the body, each length-prefixed.
pub fn text_signing_payload(sender: &str, sent_at_ms: u64, body: &str) -> Vec<u8> {
    let len = TEXT_SIGNATURE_CONTEXT.len() + sender.len() + body.len() + 24;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(TEXT_SIGNATURE_CONTEXT);
    out.extend_from_slice(&(sender.len() as u64).to_be_bytes());
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(&sent_at_ms.to_be_bytes());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

/// Plaintext of one [`chatter_crypto::SecureFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    Text {
        body: String,
        sent_at_ms: u64,
        /// Present when the sender chose to sign.
        signature: Option<MessageSignature>,
    },
    /// Encrypted file object handed to the peer for local retrieval.
    FileOffer { object: FileObject },
    /// Ask the peer to open one of its file objects for us.
    FileRequest {
        request_id: u64,
        file_id: String,
        password: String,
    },
    FileContent {
        request_id: u64,
        file_id: String,
        name: String,
        checksum: String,
        payload: Vec<u8>,
    },
    /// Single generic refusal for any failed [`ChannelMessage::FileRequest`].
    AccessDenied { request_id: u64 },
    Close,
}

impl ChannelMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        bincode_options()
            .serialize(self)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        bincode_options()
            .deserialize(bytes)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "Text",
            Self::FileOffer { .. } => "FileOffer",
            Self::FileRequest { .. } => "FileRequest",
            Self::FileContent { .. } => "FileContent",
            Self::AccessDenied { .. } => "AccessDenied",
            Self::Close => "Close",
        }
    }
}
