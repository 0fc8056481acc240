//! Type-erased byte streams

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional stream the proxy can splice, encrypt or hand off
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, boxed [`ProxyStream`]
pub type BoxStream = Box<dyn ProxyStream>;
