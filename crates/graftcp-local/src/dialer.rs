//! Upstream dialers: direct TCP, SOCKS5 CONNECT and HTTP CONNECT.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::error::DialError;

/// Upper bound on an HTTP proxy's CONNECT response head.
const MAX_HEADER_SIZE: usize = 8192;

/// SOCKS5 username/password, passed through to the proxy as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How an upstream connection is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialer {
    Direct,
    Socks5 {
        proxy: SocketAddr,
        credentials: Option<Credentials>,
    },
    HttpConnect {
        proxy: SocketAddr,
    },
}

impl fmt::Display for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialer::Direct => f.write_str("direct"),
            Dialer::Socks5 { proxy, .. } => write!(f, "socks5://{proxy}"),
            Dialer::HttpConnect { proxy } => write!(f, "http://{proxy}"),
        }
    }
}

impl Dialer {
    pub fn is_direct(&self) -> bool {
        matches!(self, Dialer::Direct)
    }

    /// Open a stream to `dest` (`host:port` or `[v6]:port`) through this dialer.
    pub async fn dial(&self, dest: &str) -> Result<TcpStream, DialError> {
        match self {
            Dialer::Direct => Ok(TcpStream::connect(dest).await?),
            Dialer::Socks5 { proxy, credentials } => {
                // RFC 1928 CONNECT, with RFC 1929 username/password when set
                let stream = match credentials {
                    Some(creds) => {
                        Socks5Stream::connect_with_password(
                            *proxy,
                            dest,
                            &creds.username,
                            &creds.password,
                        )
                        .await
                    }
                    None => Socks5Stream::connect(*proxy, dest).await,
                }
                .map_err(socks_error)?;
                Ok(stream.into_inner())
            }
            Dialer::HttpConnect { proxy } => {
                let mut stream = TcpStream::connect(proxy).await?;
                http_connect_handshake(&mut stream, dest).await?;
                Ok(stream)
            }
        }
    }
}

fn socks_error(e: tokio_socks::Error) -> DialError {
    match e {
        tokio_socks::Error::Io(e) => DialError::Io(e),
        other => DialError::Socks5(other.to_string()),
    }
}

/// Issue `CONNECT dest` and accept any 2xx response.
///
/// The response head is read a byte at a time so no tunneled bytes are
/// consumed past the blank line.
async fn http_connect_handshake(stream: &mut TcpStream, dest: &str) -> Result<(), DialError> {
    let request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEADER_SIZE {
            return Err(DialError::HttpConnect("response header too large".to_string()));
        }
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DialError::HttpConnect(
                    "proxy closed connection before responding".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| DialError::HttpConnect(format!("malformed status line {status_line:?}")))?;

    if !(200..300).contains(&status) {
        return Err(DialError::HttpConnect(format!(
            "connect {dest} refused: {status_line}"
        )));
    }
    Ok(())
}
