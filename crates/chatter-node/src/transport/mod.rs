//! Transport adapter.
//!
//! Hands the session layer an opaque ordered byte stream, either a direct TCP
//! connection or one tunneled through a SOCKS proxy. Nothing above this
//! module knows which.

mod error;
mod socks;

pub use error::{TransportError, TransportErrorKind};
pub use socks::{ProxyConnector, ProxyCredentials, Socks5Connector, socks5_handshake};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use zeroize::Zeroizing;

use chatter_core::{NetworkPolicy, ProxyMode};

/// Any ordered, reliable byte stream a session can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// A parsed `host:port` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let invalid = || {
            TransportError::new(
                TransportErrorKind::InvalidAddress,
                format!("expected host:port, got {address:?}"),
            )
        };
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An established byte stream to a peer.
pub struct Connection {
    stream: BoxedStream,
    peer: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(stream: impl PeerStream, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Address (or label) of the remote end, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }
}

/// Opens outbound connections according to a [`NetworkPolicy`].
#[derive(Debug, Clone)]
pub struct TransportAdapter {
    proxy: Arc<dyn ProxyConnector>,
}

impl Default for TransportAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportAdapter {
    /// Adapter using SOCKS5 for anonymizing connections.
    pub fn new() -> Self {
        Self::with_proxy_connector(Arc::new(Socks5Connector))
    }

    pub fn with_proxy_connector(proxy: Arc<dyn ProxyConnector>) -> Self {
        Self { proxy }
    }

    /// Connect to `address`, applying the policy's connect timeout.
    pub async fn connect(
        &self,
        address: &str,
        policy: &NetworkPolicy,
    ) -> Result<Connection, TransportError> {
        let target = TargetAddr::parse(address)?;
        let timeout = policy.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.open(&target, policy))
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("connect to {target} timed out after {}ms", timeout.as_millis()),
                )
            })??;

        info!(target = %target, mode = ?policy.proxy_mode, "Transport connected");
        Ok(Connection {
            stream,
            peer: target.to_string(),
        })
    }

    async fn open(
        &self,
        target: &TargetAddr,
        policy: &NetworkPolicy,
    ) -> Result<BoxedStream, TransportError> {
        match policy.proxy_mode {
            ProxyMode::None => {
                debug!(target = %target, "Connecting directly");
                let stream = TcpStream::connect((target.host.as_str(), target.port))
                    .await
                    .map_err(|e| {
                        TransportError::new(
                            TransportErrorKind::TargetUnreachable,
                            format!("{target}: {e}"),
                        )
                    })?;
                // Chat frames are small and latency-sensitive.
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            ProxyMode::Anonymizing => {
                let proxy = policy.proxy_endpoint.as_deref().ok_or_else(|| {
                    TransportError::new(
                        TransportErrorKind::InvalidAddress,
                        "anonymizing mode requires a proxy endpoint",
                    )
                })?;
                let credentials = policy.proxy_username.as_ref().map(|username| ProxyCredentials {
                    username: username.clone(),
                    password: Zeroizing::new(policy.proxy_password.clone().unwrap_or_default()),
                });
                debug!(target = %target, proxy, "Connecting through proxy");
                self.proxy
                    .connect_via(proxy, target, credentials.as_ref())
                    .await
            }
        }
    }
}

/// Accepts inbound peer connections for the responder side.
#[derive(Debug)]
pub struct TransportListener {
    listener: TcpListener,
}

impl TransportListener {
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            TransportError::new(TransportErrorKind::Io, format!("bind {address}: {e}"))
        })?;
        info!(addr = %address, "Listening for peers");
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        info!(peer_addr = %addr, "Accepted peer connection");
        Ok(Connection::new(stream, addr.to_string()))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}
