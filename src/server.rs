//! Proxy assembly and the client connection service

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::body::Body;
use crate::conditions::{ReqCond, RespCond};
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::dialer::ConnectDialer;
use crate::dispatcher;
use crate::handlers::{
    ConnectAction, FuncHttpsHandler, FuncReqHandler, FuncRespHandler, HijackConnect, Hijacker,
    HttpsHandler, RequestHandler, ResponseHandler,
};
use crate::mitm::{
    CaTlsConfig, CertStorage, CertificateAuthority, ExpiringCertStore, MitmError, TlsConfigSource,
    UpstreamTlsConfig,
};
use crate::transport::{HttpTransport, RoundTrip};

/// Default lifetime of cached leaf certificates
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(3600);

/// Default interval between cache sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Size limits applied to client requests
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Tunables applied to every connection
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub keep_accept_encoding: bool,
    pub limits: Limits,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            keep_accept_encoding: false,
            limits: Limits::default(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(120)),
        }
    }
}

// ============================================================================
// Routes
// ============================================================================

pub(crate) struct RequestRoute {
    conds: Vec<ReqCond>,
    pub(crate) handler: Arc<dyn RequestHandler>,
}

pub(crate) struct ResponseRoute {
    conds: Vec<RespCond>,
    pub(crate) handler: Arc<dyn ResponseHandler>,
}

pub(crate) struct HttpsRoute {
    conds: Vec<ReqCond>,
    pub(crate) handler: Arc<dyn HttpsHandler>,
}

impl RequestRoute {
    pub(crate) fn matches(&self, req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        self.conds.iter().all(|c| c.matches_request(req, ctx))
    }
}

impl HttpsRoute {
    pub(crate) fn matches(&self, req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        self.conds.iter().all(|c| c.matches_request(req, ctx))
    }
}

impl ResponseRoute {
    pub(crate) fn matches(&self, resp: Option<&Response<Body>>, ctx: &ProxyCtx) -> bool {
        self.conds.iter().all(|c| c.matches_response(resp, ctx))
    }
}

// ============================================================================
// Proxy
// ============================================================================

struct ProxyInner {
    sessions: AtomicU64,
    request_routes: Vec<RequestRoute>,
    response_routes: Vec<ResponseRoute>,
    https_routes: Vec<HttpsRoute>,
    non_proxy_handler: Option<Arc<dyn RequestHandler>>,
    transport: Arc<dyn RoundTrip>,
    dialer: ConnectDialer,
    mitm_tls: Arc<dyn TlsConfigSource>,
    ca: Arc<CertificateAuthority>,
    options: ProxyOptions,
}

/// Intercepting forward proxy; cheap to clone
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    pub(crate) fn next_session(&self) -> u64 {
        self.inner.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// CA signing intercepted leaves
    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.inner.ca
    }

    pub(crate) fn request_routes(&self) -> &[RequestRoute] {
        &self.inner.request_routes
    }

    pub(crate) fn response_routes(&self) -> &[ResponseRoute] {
        &self.inner.response_routes
    }

    pub(crate) fn https_routes(&self) -> &[HttpsRoute] {
        &self.inner.https_routes
    }

    pub(crate) fn non_proxy_handler(&self) -> Option<&Arc<dyn RequestHandler>> {
        self.inner.non_proxy_handler.as_ref()
    }

    pub(crate) fn transport(&self) -> Arc<dyn RoundTrip> {
        Arc::clone(&self.inner.transport)
    }

    pub(crate) fn connect_dialer(&self) -> &ConnectDialer {
        &self.inner.dialer
    }

    pub(crate) fn mitm_tls(&self) -> Arc<dyn TlsConfigSource> {
        Arc::clone(&self.inner.mitm_tls)
    }

    pub(crate) fn keep_accept_encoding(&self) -> bool {
        self.inner.options.keep_accept_encoding
    }

    pub(crate) fn limits(&self) -> Limits {
        self.inner.options.limits
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.inner.options.connect_timeout
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.inner.options.idle_timeout
    }

    /// Accept connections forever, one task per client
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, "Proxy listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, client_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %local, "Proxy shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(client = %client_addr, error = %e, "Failed to set TCP_NODELAY");
            }
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy.serve_connection(stream, client_addr).await;
            });
        }
    }

    /// Serve every request arriving on one client connection
    pub async fn serve_connection<S>(&self, stream: S, client_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!(client = %client_addr, "Connection accepted");
        let proxy = self.clone();
        let service = service_fn(move |req| dispatcher::handle(proxy.clone(), req, client_addr));

        let conn = self
            .http1_builder()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(client = %client_addr, error = %e, "Connection ended with error");
        }
    }

    /// HTTP/1 server settings shared by client connections and intercepted tunnels.
    ///
    /// The header read timer also runs while a keep-alive connection waits
    /// for its next request, so it doubles as the idle timeout.
    pub(crate) fn http1_builder(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.idle_timeout())
            .max_header_size(self.limits().max_header_size)
            .half_close(true)
            .auto_date_header(false)
            .preserve_header_case(true)
            .title_case_headers(true);
        builder
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Proxy`]
pub struct ProxyBuilder {
    ca: Option<Arc<CertificateAuthority>>,
    cert_store: Option<Arc<dyn CertStorage>>,
    mitm_tls: Option<Arc<dyn TlsConfigSource>>,
    transport: Option<Arc<dyn RoundTrip>>,
    upstream_tls: Option<UpstreamTlsConfig>,
    dialer: ConnectDialer,
    options: ProxyOptions,
    request_routes: Vec<RequestRoute>,
    response_routes: Vec<ResponseRoute>,
    https_routes: Vec<HttpsRoute>,
    non_proxy_handler: Option<Arc<dyn RequestHandler>>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyBuilder {
    /// Bundled CA, TTL certificate cache, dialer following the environment
    pub fn new() -> Self {
        Self {
            ca: None,
            cert_store: None,
            mitm_tls: None,
            transport: None,
            upstream_tls: None,
            dialer: ConnectDialer::from_env(),
            options: ProxyOptions::default(),
            request_routes: Vec::new(),
            response_routes: Vec::new(),
            https_routes: Vec::new(),
            non_proxy_handler: None,
        }
    }

    pub fn ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn cert_store(mut self, store: Arc<dyn CertStorage>) -> Self {
        self.cert_store = Some(store);
        self
    }

    /// Replace the default CA-backed TLS source for intercepted tunnels
    pub fn mitm_tls(mut self, source: Arc<dyn TlsConfigSource>) -> Self {
        self.mitm_tls = Some(source);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Client TLS settings for origin connections made by the default transport
    pub fn upstream_tls(mut self, tls: UpstreamTlsConfig) -> Self {
        self.upstream_tls = Some(tls);
        self
    }

    pub fn connect_dialer(mut self, dialer: ConnectDialer) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn options(mut self, options: ProxyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn keep_accept_encoding(mut self, keep: bool) -> Self {
        self.options.keep_accept_encoding = keep;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Handler for requests not addressed to a proxy (origin-form targets)
    pub fn non_proxy_handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.non_proxy_handler = Some(Arc::new(handler));
        self
    }

    /// Register request-side handlers gated by `conds` (all must match)
    pub fn on_request<I>(self, conds: I) -> OnRequest
    where
        I: IntoIterator<Item = ReqCond>,
    {
        OnRequest {
            builder: self,
            conds: conds.into_iter().collect(),
        }
    }

    /// Register response handlers gated by `conds` (all must match)
    pub fn on_response<I>(self, conds: I) -> OnResponse
    where
        I: IntoIterator<Item = RespCond>,
    {
        OnResponse {
            builder: self,
            conds: conds.into_iter().collect(),
        }
    }

    /// Must run inside a tokio runtime: the default cache spawns its sweeper
    pub fn build(self) -> Result<Proxy, MitmError> {
        let ca = match self.ca {
            Some(ca) => ca,
            None => Arc::new(CertificateAuthority::bundled()?),
        };

        let mitm_tls = match self.mitm_tls {
            Some(source) => source,
            None => {
                let store: Arc<dyn CertStorage> = match self.cert_store {
                    Some(store) => store,
                    None => ExpiringCertStore::with_sweeper(DEFAULT_CERT_TTL, DEFAULT_SWEEP_INTERVAL),
                };
                Arc::new(CaTlsConfig::new(Arc::clone(&ca), store))
            }
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let tls = match self.upstream_tls {
                    Some(tls) => tls,
                    None => UpstreamTlsConfig::new()?,
                };
                Arc::new(HttpTransport::new(
                    self.dialer.clone(),
                    tls,
                    self.options.connect_timeout,
                ))
            }
        };

        Ok(Proxy {
            inner: Arc::new(ProxyInner {
                sessions: AtomicU64::new(0),
                request_routes: self.request_routes,
                response_routes: self.response_routes,
                https_routes: self.https_routes,
                non_proxy_handler: self.non_proxy_handler,
                transport,
                dialer: self.dialer,
                mitm_tls,
                ca,
                options: self.options,
            }),
        })
    }
}

/// Pending request-side registration
pub struct OnRequest {
    builder: ProxyBuilder,
    conds: Vec<ReqCond>,
}

impl OnRequest {
    pub fn handle(mut self, handler: impl RequestHandler + 'static) -> ProxyBuilder {
        self.builder.request_routes.push(RequestRoute {
            conds: self.conds,
            handler: Arc::new(handler),
        });
        self.builder
    }

    pub fn handle_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(Request<Body>, &mut ProxyCtx) -> (Request<Body>, Option<Response<Body>>)
            + Send
            + Sync
            + 'static,
    {
        self.handle(FuncReqHandler(f))
    }

    pub fn handle_connect(mut self, handler: impl HttpsHandler + 'static) -> ProxyBuilder {
        self.builder.https_routes.push(HttpsRoute {
            conds: self.conds,
            handler: Arc::new(handler),
        });
        self.builder
    }

    pub fn handle_connect_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(&str, &mut ProxyCtx) -> Option<(ConnectAction, String)> + Send + Sync + 'static,
    {
        self.handle_connect(FuncHttpsHandler(f))
    }

    /// Answer matching CONNECTs with `200` and hand the socket to `hijacker`
    pub fn hijack_connect(self, hijacker: impl Hijacker + 'static) -> ProxyBuilder {
        self.handle_connect(HijackConnect(Arc::new(hijacker)))
    }
}

/// Pending response-side registration
pub struct OnResponse {
    builder: ProxyBuilder,
    conds: Vec<RespCond>,
}

impl OnResponse {
    pub fn handle(mut self, handler: impl ResponseHandler + 'static) -> ProxyBuilder {
        self.builder.response_routes.push(ResponseRoute {
            conds: self.conds,
            handler: Arc::new(handler),
        });
        self.builder
    }

    pub fn handle_fn<F>(self, f: F) -> ProxyBuilder
    where
        F: Fn(Option<Response<Body>>, &mut ProxyCtx) -> Option<Response<Body>>
            + Send
            + Sync
            + 'static,
    {
        self.handle(FuncRespHandler(f))
    }
}
