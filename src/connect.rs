//! CONNECT handling
//!
//! Each CONNECT is offered to the registered HTTPS handlers in order; the
//! first one returning a decision wins and the default is a blind tunnel.
//! Accepted tunnels take the client stream from hyper once the `200` has
//! been written.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Channel};
use hyper::body::Incoming;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::body::{self, Body, BoxError};
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::error::{ProxyError, Result};
use crate::handlers::{ConnectAction, Hijacker};
use crate::mitm::interceptor;
use crate::server::Proxy;

/// Buffer between a proxy-auth hijacker and the client connection
const CHALLENGE_BUFFER: usize = 16 * 1024;

/// Parse and validate a CONNECT authority (`host[:port]`).
/// Returns (host, port) or an error message; IPv6 hosts keep their brackets.
pub(crate) fn parse_authority(authority: &str, default_port: u16) -> std::result::Result<(String, u16), String> {
    if authority.is_empty() {
        return Err("Authority cannot be empty".to_string());
    }

    let (host, port) = match authority.rsplit_once(':') {
        _ if authority.ends_with(']') => (authority, None),
        // Unbracketed IPv6 literal without port
        Some((host, _)) if host.contains(':') && !host.starts_with('[') => (authority, None),
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port = match port {
        None => default_port,
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            format!("Invalid port '{raw}': must be a number between 1 and 65535")
        })?,
    };
    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    Ok((host, port))
}

/// CONNECT target: request-target authority, else the Host header
fn connect_target<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Decide a CONNECT and produce the answer hyper writes back.
///
/// Returning an error makes hyper drop the connection without a reply,
/// which is how a bare rejection looks to the client.
pub(crate) async fn handle_connect(
    proxy: Proxy,
    mut req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<Body>> {
    let mut ctx = ProxyCtx::new(&proxy, client_addr, RequestInfo::from_request(&req));

    let Some(target) = connect_target(&req) else {
        warn!(session = ctx.session(), "[CONNECT] Missing authority in CONNECT request");
        return Ok(body::text_response(StatusCode::BAD_REQUEST, "missing CONNECT authority"));
    };

    let (action, host) = decide(&proxy, &target, &mut ctx).await;
    info!(
        session = ctx.session(),
        client = %client_addr,
        target = %target,
        host = %host,
        action = action.name(),
        "[CONNECT] Decision"
    );

    let client = hyper::upgrade::on(&mut req);
    match action {
        ConnectAction::Accept => tunnel(&proxy, client, &host, ctx).await,
        ConnectAction::Reject(None) => Err(ProxyError::ConnectRejected { host }),
        ConnectAction::Reject(Some(mut resp)) => {
            resp.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            Ok(resp)
        }
        ConnectAction::Hijack(hijacker) => {
            tokio::spawn(async move {
                if let Some(stream) = upgraded(client, &ctx).await {
                    let req = ctx.req.clone();
                    hijacker.hijack(req, Box::new(stream), &mut ctx).await;
                }
            });
            Ok(established())
        }
        ConnectAction::ProxyAuthHijack(hijacker) => Ok(challenge(hijacker, ctx)),
        ConnectAction::HttpMitm => {
            tokio::spawn(async move {
                if let Some(stream) = upgraded(client, &ctx).await {
                    interceptor::serve_plain(&proxy, stream, &host, ctx).await;
                }
            });
            Ok(established())
        }
        ConnectAction::Mitm(source) => {
            let source = source.unwrap_or_else(|| proxy.mitm_tls());
            tokio::spawn(async move {
                if let Some(stream) = upgraded(client, &ctx).await {
                    interceptor::serve_tls(&proxy, stream, &host, source, ctx).await;
                }
            });
            Ok(established())
        }
    }
}

/// `HTTP/1.0 200 OK` with nothing else; the tunnel starts right after
fn established() -> Response<Body> {
    let mut resp = Response::new(body::empty());
    *resp.version_mut() = Version::HTTP_10;
    resp
}

/// Wait for hyper to release the client stream after the `200`
async fn upgraded(client: OnUpgrade, ctx: &ProxyCtx) -> Option<TokioIo<Upgraded>> {
    match client.await {
        Ok(upgraded) => Some(TokioIo::new(upgraded)),
        Err(e) => {
            debug!(
                session = ctx.session(),
                error = %e,
                "[CONNECT] Client went away before the tunnel opened"
            );
            None
        }
    }
}

async fn decide(proxy: &Proxy, host: &str, ctx: &mut ProxyCtx) -> (ConnectAction, String) {
    for route in proxy.https_routes() {
        if !route.matches(&ctx.req, ctx) {
            continue;
        }
        if let Some(decision) = route.handler.handle_connect(host, ctx).await {
            return decision;
        }
    }
    (ConnectAction::Accept, host.to_string())
}

async fn tunnel(
    proxy: &Proxy,
    client: OnUpgrade,
    host: &str,
    ctx: ProxyCtx,
) -> Result<Response<Body>> {
    let addr = match parse_authority(host, 80) {
        Ok((host, port)) => format!("{host}:{port}"),
        Err(msg) => {
            warn!(session = ctx.session(), host, error = %msg, "[CONNECT] Invalid authority");
            return Ok(body::text_response(StatusCode::BAD_REQUEST, msg));
        }
    };

    // Dial before answering so a dead target gets a 502 instead of a 200
    let upstream = match proxy.connect_dialer().dial(&addr, proxy.connect_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(session = ctx.session(), addr = %addr, error = %e, "[CONNECT] Failed to connect to target");
            return Ok(body::text_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    tokio::spawn(async move {
        let Some(client) = upgraded(client, &ctx).await else {
            return;
        };
        let started = Instant::now();
        let (client_to_server, server_to_client) = splice(client, upstream).await;
        info!(
            session = ctx.session(),
            addr = %addr,
            client_to_server,
            server_to_client,
            duration_ms = started.elapsed().as_millis() as u64,
            "[CONNECT] Tunnel closed"
        );
    });
    Ok(established())
}

/// Copy both directions until each side has finished.
///
/// When one direction ends, the write half it was feeding is shut down so
/// the peer sees EOF; the other direction keeps flowing until it ends too.
pub(crate) async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await;
        if let Err(e) = b_write.shutdown().await {
            debug!(error = %e, "Tunnel shutdown (server side) failed");
        }
        copied.unwrap_or_else(|e| {
            debug!(error = %e, "Tunnel copy (client to server) ended with error");
            0
        })
    };
    let backward = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        if let Err(e) = a_write.shutdown().await {
            debug!(error = %e, "Tunnel shutdown (client side) failed");
        }
        copied.unwrap_or_else(|e| {
            debug!(error = %e, "Tunnel copy (server to client) ended with error");
            0
        })
    };

    tokio::join!(forward, backward)
}

/// `407` whose body is whatever the hijacker writes.
///
/// A non-2xx answer to CONNECT never turns into a tunnel, so the hijacker
/// gets a write-only stream: its reads see EOF, its writes follow the head
/// and the connection closes when it drops the stream.
fn challenge(hijacker: Arc<dyn Hijacker>, mut ctx: ProxyCtx) -> Response<Body> {
    let (ours, theirs) = tokio::io::duplex(CHALLENGE_BUFFER);
    let (mut sender, channel) = Channel::<Bytes, BoxError>::new(1);

    tokio::spawn(async move {
        let req = ctx.req.clone();
        hijacker.hijack(req, Box::new(theirs), &mut ctx).await;
    });

    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(ours);
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "[CONNECT] Cannot close hijacker input");
        }
        let mut buf = BytesMut::with_capacity(CHALLENGE_BUFFER);
        loop {
            buf.reserve(CHALLENGE_BUFFER);
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if sender.send_data(buf.split().freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "[CONNECT] Hijacker stream failed");
                    break;
                }
            }
        }
    });

    let mut resp = Response::new(channel.boxed());
    *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    // HTTP/1.0 keeps the body close-delimited, so the hijacker's bytes go out verbatim
    *resp.version_mut() = Version::HTTP_10;
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}
