//! Handler capabilities invoked by the proxy core
//!
//! Request handlers may rewrite a request or short-circuit it with a canned
//! response. Response handlers see whatever came back (or `None` when the
//! round trip failed). HTTPS handlers decide what happens to a CONNECT, and
//! hijackers take ownership of the raw client connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response};

use crate::body::Body;
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::mitm::TlsConfigSource;
use crate::stream::BoxStream;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Returning a response skips the upstream round trip
    async fn handle_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyCtx,
    ) -> (Request<Body>, Option<Response<Body>>);
}

#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle_response(
        &self,
        resp: Option<Response<Body>>,
        ctx: &mut ProxyCtx,
    ) -> Option<Response<Body>>;
}

#[async_trait]
pub trait HttpsHandler: Send + Sync {
    /// Decide the fate of `CONNECT host`. `None` defers to the next handler.
    ///
    /// The returned host replaces the CONNECT target for the chosen action.
    async fn handle_connect(
        &self,
        host: &str,
        ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)>;
}

/// Takes over a client connection after the proxy answered the CONNECT
#[async_trait]
pub trait Hijacker: Send + Sync {
    async fn hijack(&self, req: RequestInfo, client: BoxStream, ctx: &mut ProxyCtx);
}

/// What to do with a CONNECT request
pub enum ConnectAction {
    /// Blind TCP tunnel to the target
    Accept,
    /// Refuse, optionally writing a canned response first
    Reject(Option<Response<Body>>),
    /// Terminate TLS with a forged certificate; `None` uses the proxy's source
    Mitm(Option<Arc<dyn TlsConfigSource>>),
    /// Treat the tunnel as plaintext HTTP/1.x
    HttpMitm,
    /// Answer `200` and hand the connection over
    Hijack(Arc<dyn Hijacker>),
    /// Answer `407` and hand the connection over
    ProxyAuthHijack(Arc<dyn Hijacker>),
}

impl ConnectAction {
    /// Intercept with the proxy's default TLS source
    pub fn mitm() -> Self {
        Self::Mitm(None)
    }

    /// Close the connection without writing anything
    pub fn reject() -> Self {
        Self::Reject(None)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject(_) => "reject",
            Self::Mitm(_) => "mitm",
            Self::HttpMitm => "http-mitm",
            Self::Hijack(_) => "hijack",
            Self::ProxyAuthHijack(_) => "proxy-auth-hijack",
        }
    }
}

impl fmt::Debug for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Closure adapters
// ============================================================================

/// [`RequestHandler`] backed by a closure
pub struct FuncReqHandler<F>(pub F);

#[async_trait]
impl<F> RequestHandler for FuncReqHandler<F>
where
    F: Fn(Request<Body>, &mut ProxyCtx) -> (Request<Body>, Option<Response<Body>>) + Send + Sync,
{
    async fn handle_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyCtx,
    ) -> (Request<Body>, Option<Response<Body>>) {
        (self.0)(req, ctx)
    }
}

/// [`ResponseHandler`] backed by a closure
pub struct FuncRespHandler<F>(pub F);

#[async_trait]
impl<F> ResponseHandler for FuncRespHandler<F>
where
    F: Fn(Option<Response<Body>>, &mut ProxyCtx) -> Option<Response<Body>> + Send + Sync,
{
    async fn handle_response(
        &self,
        resp: Option<Response<Body>>,
        ctx: &mut ProxyCtx,
    ) -> Option<Response<Body>> {
        (self.0)(resp, ctx)
    }
}

/// [`HttpsHandler`] backed by a closure
pub struct FuncHttpsHandler<F>(pub F);

#[async_trait]
impl<F> HttpsHandler for FuncHttpsHandler<F>
where
    F: Fn(&str, &mut ProxyCtx) -> Option<(ConnectAction, String)> + Send + Sync,
{
    async fn handle_connect(
        &self,
        host: &str,
        ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)> {
        (self.0)(host, ctx)
    }
}

/// Always answers with the wrapped hijacker
pub(crate) struct HijackConnect(pub Arc<dyn Hijacker>);

#[async_trait]
impl HttpsHandler for HijackConnect {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)> {
        Some((ConnectAction::Hijack(Arc::clone(&self.0)), host.to_string()))
    }
}

// ============================================================================
// Ready-made CONNECT policies
// ============================================================================

/// Intercept every matching CONNECT with the proxy's CA
pub struct AlwaysMitm;

/// Refuse every matching CONNECT
pub struct AlwaysReject;

/// Read every matching CONNECT tunnel as plaintext HTTP
pub struct AlwaysHttpMitm;

#[async_trait]
impl HttpsHandler for AlwaysMitm {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)> {
        Some((ConnectAction::mitm(), host.to_string()))
    }
}

#[async_trait]
impl HttpsHandler for AlwaysReject {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)> {
        Some((ConnectAction::reject(), host.to_string()))
    }
}

#[async_trait]
impl HttpsHandler for AlwaysHttpMitm {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> Option<(ConnectAction, String)> {
        Some((ConnectAction::HttpMitm, host.to_string()))
    }
}
