//! Length-prefixed, versioned wire framing.
//!
//! ```text
//! +----------------+---------+------+------------------+
//! | len: u32 (BE)  | version | kind | bincode body ... |
//! +----------------+---------+------+------------------+
//! ```
//!
//! `len` counts everything after the prefix.

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use chatter_crypto::{ClientFinish, ClientHello, PROTOCOL_VERSION, SecureFrame, ServerHello};

const HEADER_LEN: usize = 2;

const KIND_CLIENT_HELLO: u8 = 1;
const KIND_SERVER_HELLO: u8 = 2;
const KIND_CLIENT_FINISH: u8 = 3;
const KIND_FRAME: u8 = 4;

/// Bincode settings shared by handshake bodies and frame payloads.
///
/// Fixed-width integers, and a body must be consumed exactly.
pub(crate) fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Wire codec errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Clean end of stream at a message boundary.
    #[error("Connection closed by peer")]
    Closed,

    #[error("Message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message kind {0}")]
    UnknownKind(u8),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Every message that can appear on the peer-to-peer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    ClientFinish(ClientFinish),
    Frame(SecureFrame),
}

impl WireMessage {
    /// Short name for logs and protocol-violation messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "ClientHello",
            Self::ServerHello(_) => "ServerHello",
            Self::ClientFinish(_) => "ClientFinish",
            Self::Frame(_) => "Frame",
        }
    }
}

/// Serialize `msg` into `version || kind || body` (no length prefix).
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    fn with_header<T: Serialize>(kind: u8, body: &T) -> Result<Vec<u8>, WireError> {
        let mut out = vec![PROTOCOL_VERSION, kind];
        bincode_options()
            .serialize_into(&mut out, body)
            .map_err(|e| WireError::Malformed(e.to_string()))?;
        Ok(out)
    }

    match msg {
        WireMessage::ClientHello(m) => with_header(KIND_CLIENT_HELLO, m),
        WireMessage::ServerHello(m) => with_header(KIND_SERVER_HELLO, m),
        WireMessage::ClientFinish(m) => with_header(KIND_CLIENT_FINISH, m),
        WireMessage::Frame(m) => with_header(KIND_FRAME, m),
    }
}

/// Parse `version || kind || body`.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, WireError> {
    fn body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
        bincode_options()
            .deserialize(bytes)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    let (&version, rest) = bytes
        .split_first()
        .ok_or_else(|| WireError::Malformed("empty message".into()))?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let (&kind, rest) = rest
        .split_first()
        .ok_or_else(|| WireError::Malformed("missing kind".into()))?;

    match kind {
        KIND_CLIENT_HELLO => body(rest).map(WireMessage::ClientHello),
        KIND_SERVER_HELLO => body(rest).map(WireMessage::ServerHello),
        KIND_CLIENT_FINISH => body(rest).map(WireMessage::ClientFinish),
        KIND_FRAME => body(rest).map(WireMessage::Frame),
        other => Err(WireError::UnknownKind(other)),
    }
}

/// Write one length-prefixed message and flush.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &WireMessage,
    max_len: usize,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let data = encode(msg)?;
    if data.len() > max_len {
        return Err(WireError::TooLarge {
            len: data.len(),
            max: max_len,
        });
    }
    let len = u32::try_from(data.len()).map_err(|_| WireError::TooLarge {
        len: data.len(),
        max: max_len,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// EOF before the first prefix byte is [`WireError::Closed`]; EOF anywhere
/// else is an I/O error.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let first = reader.read(&mut len_bytes[..1]).await?;
    if first == 0 {
        return Err(WireError::Closed);
    }
    reader.read_exact(&mut len_bytes[1..]).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(WireError::TooLarge { len, max: max_len });
    }
    if len < HEADER_LEN {
        return Err(WireError::Malformed(format!("message of {len} bytes")));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    decode(&data)
}
