//! Interpose - Intercepting HTTP/HTTPS Forward Proxy
//!
//! Interpose is a programmable forward proxy. Plain HTTP requests and CONNECT
//! tunnels pass through user-registered handlers that can inspect, rewrite,
//! answer or block traffic, and HTTPS tunnels can be intercepted with leaf
//! certificates signed on the fly by a local CA.
//!
//! ## Features
//!
//! - **HTTP/1.x proxying**: keep-alive, chunked and streaming bodies, WebSocket upgrades
//! - **CONNECT policies**: tunnel, reject, intercept (TLS or plaintext), hijack
//! - **MITM/SSL Interception**: deterministic leaf signing with a bundled or custom CA
//! - **Certificate caching**: TTL store with a background sweeper, LRU, or none
//! - **Upstream chaining**: CONNECT through another proxy, including `HTTPS_PROXY`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use interpose::conditions::req_host_is;
//! use interpose::{AlwaysMitm, AlwaysReject, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Proxy::builder()
//!         .on_request([req_host_is(["blocked.example:443"])])
//!         .handle_connect(AlwaysReject)
//!         .on_request([])
//!         .handle_connect(AlwaysMitm)
//!         .on_response([])
//!         .handle_fn(|resp, ctx| {
//!             tracing::info!(session = ctx.session(), uri = %ctx.req.uri, "seen");
//!             resp
//!         })
//!         .build()?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     proxy.serve(listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - `Proxy`, its builder and the hyper connection setup
//! - `dispatcher` - request/response handler pipeline
//! - `connect` - CONNECT decisions and blind tunnels
//! - `mitm` - CA, leaf signing, certificate caches, TLS configs, interception
//! - `transport` / `dialer` - upstream round trips and next-hop dialing

// Core proxy modules
pub mod config;
pub mod ctx;
pub mod server;

mod connect;
mod dispatcher;

// Handlers and routing
pub mod conditions;
pub mod handlers;

// Wire handling
pub mod body;
pub mod http1;
pub mod stream;

// Upstream side
pub mod dialer;
pub mod transport;

pub mod error;

// MITM
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::{CertCacheBackend, Config};

/// Proxy assembly
pub use server::{Limits, OnRequest, OnResponse, Proxy, ProxyBuilder, ProxyOptions};

/// Context and handlers
pub use ctx::{ProxyCtx, RequestInfo, ResponseInfo, UserData};
pub use handlers::{
    AlwaysHttpMitm, AlwaysMitm, AlwaysReject, ConnectAction, FuncHttpsHandler, FuncReqHandler,
    FuncRespHandler, Hijacker, HttpsHandler, RequestHandler, ResponseHandler,
};

/// Upstream
pub use dialer::{ConnectDialer, NoProxy, ProxyEnv, UpstreamProxy};
pub use transport::{HttpTransport, RoundTrip};

/// Errors and bodies
pub use body::Body;
pub use error::ProxyError;
pub use stream::BoxStream;

/// MITM types and functionality
pub use mitm::{
    // Certificate generation
    CaConfig,
    CaTlsConfig,
    CertStorage,
    CertificateAuthority,
    // Caching
    ExpiringCertStore,
    LruCertStore,
    MitmError,
    NoCertCache,
    SigningRequest,
    // TLS configuration
    TlsConfigSource,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
