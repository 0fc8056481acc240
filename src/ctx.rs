//! Per-request correlation context
//!
//! A [`ProxyCtx`] is created for every CONNECT and every plain request, and
//! again for each request carried inside an intercepted tunnel. Inner
//! contexts get their own session id but share the outer context's user data
//! and transport override, so every request of a tunnel can be tied back to
//! the CONNECT that opened it.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

use crate::error::ProxyError;
use crate::server::Proxy;
use crate::transport::RoundTrip;

/// Opaque payload attached by handlers
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Snapshot of the request a context is about
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestInfo {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }

    /// `host[:port]` the request targets: URI authority, else the Host header
    pub fn host(&self) -> &str {
        if let Some(authority) = self.uri.authority() {
            return authority.as_str();
        }
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    /// Host followed by path, without scheme or query
    pub fn host_and_path(&self) -> String {
        format!("{}{}", self.host(), self.uri.path())
    }
}

/// Status and headers of the upstream response
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseInfo {
    pub fn from_response<B>(resp: &Response<B>) -> Self {
        Self {
            status: resp.status(),
            headers: resp.headers().clone(),
        }
    }
}

/// Per-request context handed to every handler
pub struct ProxyCtx {
    session: u64,
    client_addr: SocketAddr,
    proxy: Proxy,

    /// Request being processed (refreshed after each request handler)
    pub req: RequestInfo,

    /// Upstream response, once the round trip succeeded
    pub resp: Option<ResponseInfo>,

    /// Round-trip failure, visible to response handlers
    pub error: Option<Arc<ProxyError>>,

    /// Handler-defined payload, inherited by requests inside a tunnel
    pub user_data: Option<UserData>,

    /// Overrides the proxy transport for this request and its children
    pub round_tripper: Option<Arc<dyn RoundTrip>>,
}

impl ProxyCtx {
    pub fn new(proxy: &Proxy, client_addr: SocketAddr, req: RequestInfo) -> Self {
        Self {
            session: proxy.next_session(),
            client_addr,
            proxy: proxy.clone(),
            req,
            resp: None,
            error: None,
            user_data: None,
            round_tripper: None,
        }
    }

    /// Fresh context for a request multiplexed inside this context's tunnel
    pub fn child(&self, req: RequestInfo) -> Self {
        Self {
            session: self.proxy.next_session(),
            client_addr: self.client_addr,
            proxy: self.proxy.clone(),
            req,
            resp: None,
            error: None,
            user_data: self.user_data.clone(),
            round_tripper: self.round_tripper.clone(),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Typed view of the user data
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref::<T>()
    }

    pub fn set_user_data<T: Any + Send + Sync>(&mut self, data: T) {
        self.user_data = Some(Arc::new(data));
    }
}

impl fmt::Debug for ProxyCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCtx")
            .field("session", &self.session)
            .field("client_addr", &self.client_addr)
            .field("method", &self.req.method)
            .field("uri", &self.req.uri)
            .finish_non_exhaustive()
    }
}
