//! Error types for the relay endpoint.

use std::net::SocketAddr;

use thiserror::Error;

use crate::mode::SelectMode;

/// Fatal misconfiguration detected while building the proxy node.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("resolve listen address {addr}: {source}")]
    ListenAddress {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "neither {socks5:?} nor {http:?} can be resolved \
         (socks5: {socks5_error}, http proxy: {http_error}), please check the proxy config"
    )]
    NoProxyResolvable {
        socks5: String,
        http: String,
        socks5_error: String,
        http_error: String,
    },
}

/// Failures from the PID/address registry and the kernel socket tables.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no socket inode for {local} -> {remote}")]
    InodeNotFound { local: SocketAddr, remote: SocketAddr },

    #[error("read socket table: {0}")]
    Io(#[from] std::io::Error),
}

/// A notification record that could not be decoded.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed record {0:?}, expected ip:port:pid")]
    Malformed(String),
}

/// Failures while opening an upstream connection.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connect: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial timed out after {0} ms")]
    Timeout(u64),

    #[error("socks5: {0}")]
    Socks5(String),

    #[error("http proxy: {0}")]
    HttpConnect(String),
}

/// Why a single accepted connection was dropped.
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("no pid and destination found for {peer}")]
    Correlation { peer: SocketAddr },

    #[error("no dialer available in {mode} mode, please check the proxy config")]
    NoDialer { mode: SelectMode },

    #[error("dial {dest}: {source}")]
    Dial {
        dest: String,
        #[source]
        source: DialError,
    },

    #[error("read connection endpoints: {0}")]
    Endpoints(#[source] std::io::Error),
}
