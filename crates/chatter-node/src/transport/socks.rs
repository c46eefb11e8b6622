//! Client side of SOCKS5 CONNECT (RFC 1928, RFC 1929 username/password).
//!
//! Targets are sent as domain names unless they are literal IPs, so names
//! such as `.onion` addresses are resolved by the proxy and never locally.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use zeroize::Zeroizing;

use super::error::{TransportError, TransportErrorKind};
use super::{BoxedStream, TargetAddr};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Username/password for proxies that require RFC 1929 authentication.
pub struct ProxyCredentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// "Connect via proxy" capability consumed by the transport adapter.
#[async_trait]
pub trait ProxyConnector: Send + Sync + std::fmt::Debug {
    /// Open a stream to `target` through the proxy at `proxy` (`host:port`).
    async fn connect_via(
        &self,
        proxy: &str,
        target: &TargetAddr,
        credentials: Option<&ProxyCredentials>,
    ) -> Result<BoxedStream, TransportError>;
}

/// SOCKS5 proxy connector over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks5Connector;

#[async_trait]
impl ProxyConnector for Socks5Connector {
    async fn connect_via(
        &self,
        proxy: &str,
        target: &TargetAddr,
        credentials: Option<&ProxyCredentials>,
    ) -> Result<BoxedStream, TransportError> {
        let mut stream = TcpStream::connect(proxy).await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::ProxyUnreachable,
                format!("{proxy}: {e}"),
            )
        })?;
        debug!(proxy, target = %target, "Connected to proxy, negotiating");
        socks5_handshake(&mut stream, target, credentials).await?;
        Ok(Box::new(stream))
    }
}

/// Negotiate a SOCKS5 CONNECT to `target` over an open proxy stream.
///
/// On success the stream carries the tunneled connection.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VERSION, 2, AUTH_NONE, AUTH_USER_PASS]
    } else {
        &[SOCKS_VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(rejected(format!("unexpected version {:#04x}", choice[0])));
    }
    match (choice[1], credentials) {
        (AUTH_NONE, _) => {}
        (AUTH_USER_PASS, Some(creds)) => authenticate(stream, creds).await?,
        (AUTH_NO_ACCEPTABLE, _) => return Err(rejected("no acceptable auth method")),
        (method, _) => return Err(rejected(format!("unexpected auth method {method:#04x}"))),
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    encode_target(&mut request, target)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(rejected(format!("unexpected version {:#04x}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(reply_error(head[1]));
    }

    // Bound address is not used but must be drained.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => return Err(rejected(format!("unknown address type {other:#04x}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn authenticate<S>(stream: &mut S, creds: &ProxyCredentials) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    let user_len = u8::try_from(user.len()).map_err(|_| rejected("proxy username too long"))?;
    let pass_len = u8::try_from(pass.len()).map_err(|_| rejected("proxy password too long"))?;

    let mut msg = Zeroizing::new(Vec::with_capacity(3 + user.len() + pass.len()));
    msg.push(USER_PASS_VERSION);
    msg.push(user_len);
    msg.extend_from_slice(user);
    msg.push(pass_len);
    msg.extend_from_slice(pass);
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(rejected("proxy authentication failed"));
    }
    Ok(())
}

fn encode_target(buf: &mut Vec<u8>, target: &TargetAddr) -> Result<(), TransportError> {
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = target.host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| {
                TransportError::new(
                    TransportErrorKind::InvalidAddress,
                    "host name longer than 255 bytes",
                )
            })?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(name);
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    Ok(())
}

fn rejected(message: impl Into<String>) -> TransportError {
    TransportError::new(TransportErrorKind::ProxyRejected, message)
}

fn reply_error(code: u8) -> TransportError {
    let (kind, text) = match code {
        0x01 => (TransportErrorKind::ProxyRejected, "general failure"),
        0x02 => (TransportErrorKind::ProxyRejected, "connection not allowed by ruleset"),
        0x03 => (TransportErrorKind::TargetUnreachable, "network unreachable"),
        0x04 => (TransportErrorKind::TargetUnreachable, "host unreachable"),
        0x05 => (TransportErrorKind::TargetUnreachable, "connection refused"),
        0x06 => (TransportErrorKind::Timeout, "TTL expired"),
        0x07 => (TransportErrorKind::ProxyRejected, "command not supported"),
        0x08 => (TransportErrorKind::ProxyRejected, "address type not supported"),
        _ => (TransportErrorKind::ProxyRejected, "unknown reply code"),
    };
    TransportError::new(kind, format!("{text} ({code:#04x})"))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16) -> TargetAddr {
        TargetAddr {
            host: host.to_string(),
            port,
        }
    }

    /// Read a CONNECT request from the client side and return its raw bytes.
    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) -> Vec<u8> {
        let mut head = [0u8; 4];
        server.read_exact(&mut head).await.unwrap();
        let mut out = head.to_vec();
        let rest = match head[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                server.read_exact(&mut len).await.unwrap();
                out.push(len[0]);
                usize::from(len[0]) + 2
            }
            _ => panic!("bad atyp"),
        };
        let mut tail = vec![0u8; rest];
        server.read_exact(&mut tail).await.unwrap();
        out.extend_from_slice(&tail);
        out
    }

    #[tokio::test]
    async fn no_auth_domain_connect() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS_VERSION, 1, AUTH_NONE]);
            server.write_all(&[SOCKS_VERSION, AUTH_NONE]).await.unwrap();

            let request = read_request(&mut server).await;
            server
                .write_all(&[SOCKS_VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            request
        });

        socks5_handshake(&mut client, &target("abcdef.onion", 4444), None)
            .await
            .unwrap();

        let request = proxy.await.unwrap();
        let mut expected = vec![SOCKS_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, 12];
        expected.extend_from_slice(b"abcdef.onion");
        expected.extend_from_slice(&4444u16.to_be_bytes());
        assert_eq!(request, expected);
    }

    #[test]
    fn ip_targets_use_ip_address_types() {
        let mut buf = Vec::new();
        encode_target(&mut buf, &target("10.0.0.7", 80)).unwrap();
        assert_eq!(buf, [ATYP_IPV4, 10, 0, 0, 7, 0, 80]);

        let mut buf = Vec::new();
        encode_target(&mut buf, &target("::1", 80)).unwrap();
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 1 + 16 + 2);
    }

    #[tokio::test]
    async fn username_password_auth() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS_VERSION, 2, AUTH_NONE, AUTH_USER_PASS]);
            server
                .write_all(&[SOCKS_VERSION, AUTH_USER_PASS])
                .await
                .unwrap();

            let mut auth = [0u8; 2 + 5 + 1 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[..7], b"\x01\x05alice");
            assert_eq!(&auth[7..], b"\x06s3cr3t");
            server.write_all(&[USER_PASS_VERSION, 0]).await.unwrap();

            let _ = read_request(&mut server).await;
            server
                .write_all(&[SOCKS_VERSION, 0, 0, ATYP_DOMAIN, 3, b'a', b'b', b'c', 0, 1])
                .await
                .unwrap();
        });

        let creds = ProxyCredentials {
            username: "alice".to_string(),
            password: Zeroizing::new("s3cr3t".to_string()),
        };
        socks5_handshake(&mut client, &target("peer.example", 9000), Some(&creds))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn refused_target_maps_to_target_unreachable() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS_VERSION, AUTH_NONE]).await.unwrap();
            let _ = read_request(&mut server).await;
            server
                .write_all(&[SOCKS_VERSION, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_handshake(&mut client, &target("peer.example", 1), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::TargetUnreachable);
    }

    #[tokio::test]
    async fn no_acceptable_method_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
                .await
                .unwrap();
        });

        let err = socks5_handshake(&mut client, &target("peer.example", 1), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::ProxyRejected);
    }

    #[tokio::test]
    async fn unreachable_proxy() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Socks5Connector
            .connect_via(&addr.to_string(), &target("peer.example", 1), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), TransportErrorKind::ProxyUnreachable);
    }

    #[test]
    fn long_host_name_is_invalid() {
        let mut buf = Vec::new();
        let err = encode_target(&mut buf, &target(&"a".repeat(256), 1)).unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::InvalidAddress);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = ProxyCredentials {
            username: "alice".to_string(),
            password: Zeroizing::new("s3cr3t".to_string()),
        };
        assert!(!format!("{creds:?}").contains("s3cr3t"));
    }
}
