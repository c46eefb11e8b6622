//! Key exchange over a raw peer stream.
//!
//! Initiator: `ClientHello ->`, `<- ServerHello`, `ClientFinish ->`.
//! The responder only releases keys once `ClientFinish` verifies.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use chatter_crypto::{
    CryptoError, EstablishedKeys, Identity, InitiatorHandshake, KdfParams, ResponderHandshake,
    SharedSecret,
};

use crate::wire::{WireError, WireMessage, read_message, write_message};

use super::error::SessionError;

pub(crate) struct HandshakeParams {
    pub identity: Identity,
    pub secret: SharedSecret,
    pub expected_peer: Option<String>,
    pub kdf: KdfParams,
    pub max_frame_bytes: usize,
}

/// Argon2 runs off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::Internal(format!("key derivation task failed: {e}")))?
        .map_err(SessionError::from)
}

fn unexpected(expected: &str, got: &WireMessage) -> SessionError {
    SessionError::ProtocolViolation(format!("expected {expected}, got {}", got.name()))
}

pub(crate) async fn initiate<S>(
    stream: &mut S,
    params: HandshakeParams,
) -> Result<EstablishedKeys, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let HandshakeParams {
        identity,
        secret,
        expected_peer,
        kdf,
        max_frame_bytes: max,
    } = params;

    let state = blocking(move || {
        InitiatorHandshake::start(&identity, &secret, expected_peer.as_deref(), kdf)
    })
    .await?;
    write_message(stream, &WireMessage::ClientHello(state.hello().clone()), max).await?;
    debug!("ClientHello sent");

    let reply = match read_message(stream, max).await? {
        WireMessage::ServerHello(reply) => reply,
        other => return Err(unexpected("ServerHello", &other)),
    };
    let (finish, keys) = state.finish(&reply)?;
    write_message(stream, &WireMessage::ClientFinish(finish), max).await?;
    debug!(peer = %keys.peer_username(), "ClientFinish sent");
    Ok(keys)
}

pub(crate) async fn respond<S>(
    stream: &mut S,
    params: HandshakeParams,
) -> Result<EstablishedKeys, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let HandshakeParams {
        identity,
        secret,
        expected_peer,
        kdf,
        max_frame_bytes: max,
    } = params;

    let state = blocking(move || {
        ResponderHandshake::start(&identity, &secret, expected_peer.as_deref(), kdf)
    })
    .await?;

    let hello = match read_message(stream, max).await? {
        WireMessage::ClientHello(hello) => hello,
        other => return Err(unexpected("ClientHello", &other)),
    };
    let (reply, pending) = state.respond(&hello)?;
    write_message(stream, &WireMessage::ServerHello(reply), max).await?;
    debug!(peer = %hello.username, "ServerHello sent");

    match read_message(stream, max).await {
        Ok(WireMessage::ClientFinish(finish)) => Ok(pending.confirm(&finish)?),
        Ok(other) => Err(unexpected("ClientFinish", &other)),
        // An initiator that cannot verify our tag hangs up without answering.
        Err(WireError::Closed) => Err(SessionError::AuthenticationFailed),
        Err(e) => Err(e.into()),
    }
}
