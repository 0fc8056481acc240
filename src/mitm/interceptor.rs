//! MITM Interceptor - serving requests inside an accepted CONNECT
//!
//! This module handles the intercepted side of a tunnel:
//! 1. Accept the client TLS handshake with a leaf signed for the CONNECT
//!    host and the SNI name
//! 2. Serve HTTP/1.x on the decrypted stream, rewriting each request to an
//!    absolute `https://` URL
//! 3. Run every request through the normal proxy pipeline
//!
//! Plaintext tunnels (`HttpMitm`) skip step 1 and rewrite to `http://`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::uri::{PathAndQuery, Scheme};
use http::{Request, Uri};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use super::signer::{strip_port, SigningRequest};
use super::tls_config::TlsConfigSource;
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::dispatcher;
use crate::error::Result;
use crate::server::Proxy;

/// Terminate TLS on `client` and serve the requests inside
pub(crate) async fn serve_tls<S>(
    proxy: &Proxy,
    client: S,
    host: &str,
    source: Arc<dyn TlsConfigSource>,
    outer: ProxyCtx,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = match LazyConfigAcceptor::new(Acceptor::default(), client).await {
        Ok(start) => start,
        Err(e) => {
            warn!(session = outer.session(), host, error = %e, "[MITM] Failed to read ClientHello");
            return;
        }
    };

    let connect_host = strip_port(host);
    let sni = start.client_hello().server_name().map(str::to_owned);
    let mut names = vec![connect_host.to_string()];
    if let Some(sni) = sni.as_deref() {
        if !sni.eq_ignore_ascii_case(connect_host) {
            names.push(sni.to_string());
        }
    }

    let request = match SigningRequest::new(&names) {
        Ok(request) => request,
        Err(e) => {
            warn!(session = outer.session(), host, error = %e, "[MITM] Cannot build signing request");
            return;
        }
    };
    let config = match source.server_config(&request, &outer).await {
        Ok(config) => config,
        Err(e) => {
            warn!(session = outer.session(), host, error = %e, "[MITM] Cannot sign certificate");
            return;
        }
    };

    let tls = match start.into_stream(config).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!(session = outer.session(), host, sni = ?sni, error = %e, "[MITM] TLS handshake with client failed");
            return;
        }
    };
    debug!(session = outer.session(), host, sni = ?sni, "[MITM] TLS handshake complete");

    let authority = authority_for(host, 443);
    serve_http(proxy, tls, Scheme::HTTPS, authority, outer).await;
}

/// Serve plaintext HTTP/1.x requests carried by a CONNECT tunnel
pub(crate) async fn serve_plain<S>(proxy: &Proxy, client: S, host: &str, outer: ProxyCtx)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let authority = authority_for(host, 80);
    serve_http(proxy, client, Scheme::HTTP, authority, outer).await;
}

async fn serve_http<S>(proxy: &Proxy, conn: S, scheme: Scheme, authority: String, outer: ProxyCtx)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outer = Arc::new(outer);
    let served = Arc::new(AtomicU64::new(0));

    let service = {
        let proxy = proxy.clone();
        let outer = Arc::clone(&outer);
        let authority = authority.clone();
        let served = Arc::clone(&served);
        service_fn(move |req| {
            let proxy = proxy.clone();
            let outer = Arc::clone(&outer);
            let scheme = scheme.clone();
            let authority = authority.clone();
            served.fetch_add(1, Ordering::Relaxed);
            async move {
                let req = absolutize(req, &scheme, &authority).inspect_err(|e| {
                    warn!(session = outer.session(), authority = %authority, error = %e, "[MITM] Cannot rewrite request URL");
                })?;
                let mut ctx = outer.child(RequestInfo::from_request(&req));
                dispatcher::serve_request(&proxy, &mut ctx, req).await
            }
        })
    };

    let conn = proxy
        .http1_builder()
        .serve_connection(TokioIo::new(conn), service)
        .with_upgrades();
    if let Err(e) = conn.await {
        debug!(session = outer.session(), authority = %authority, error = %e, "[MITM] Connection ended with error");
    }
    info!(
        session = outer.session(),
        authority = %authority,
        requests = served.load(Ordering::Relaxed),
        "[MITM] Connection closed"
    );
}

/// `host[:port]` with the scheme's default port dropped
fn authority_for(host: &str, default_port: u16) -> String {
    let suffix = format!(":{default_port}");
    match host.strip_suffix(&suffix) {
        Some(bare) if !bare.is_empty() && !bare.ends_with(':') => bare.to_string(),
        _ => host.to_string(),
    }
}

/// Rewrite an origin-form request target to `scheme://authority/path`
fn absolutize<B>(mut req: Request<B>, scheme: &Scheme, authority: &str) -> Result<Request<B>> {
    if req.uri().scheme().is_some() {
        return Ok(req);
    }
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let uri = Uri::builder()
        .scheme(scheme.clone())
        .authority(authority)
        .path_and_query(path)
        .build()?;
    *req.uri_mut() = uri;
    Ok(req)
}
