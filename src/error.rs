//! Proxy error types

use std::io;

use thiserror::Error;

use crate::mitm::MitmError;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while serving a proxied connection
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request body too large (limit: {limit} bytes)")]
    BodyTooLarge { limit: usize },

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {addr} timed out")]
    DialTimeout { addr: String },

    #[error("Upstream proxy {proxy} refused CONNECT: {status}")]
    UpstreamProxy { proxy: String, status: String },

    #[error("Upstream HTTP error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("Failed to build message: {0}")]
    Http(#[from] http::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("CONNECT to {host} rejected")]
    ConnectRejected { host: String },

    #[error(transparent)]
    Mitm(#[from] MitmError),
}

impl ProxyError {
    /// Create a malformed request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// Create a dial error
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }
}
