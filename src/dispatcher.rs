//! Per-request pipeline shared by every HTTP/1.x connection
//!
//! request handlers -> header stripping -> round trip -> response handlers.
//! Plain proxy requests, plaintext CONNECT tunnels and decrypted MITM streams
//! all run requests through [`serve_request`]; hyper frames the answer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body as _, Incoming};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use crate::body::{self, Body};
use crate::connect;
use crate::ctx::{ProxyCtx, RequestInfo, ResponseInfo};
use crate::error::{ProxyError, Result};
use crate::http1;
use crate::server::Proxy;

const NON_PROXY_MESSAGE: &str = "This is a proxy server. Does not respond to non-proxy requests.";

/// Service behind every client connection
pub(crate) async fn handle(
    proxy: Proxy,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<Body>> {
    if req.method() == Method::CONNECT {
        return connect::handle_connect(proxy, req, client_addr).await;
    }

    let mut ctx = ProxyCtx::new(&proxy, client_addr, RequestInfo::from_request(&req));
    if is_proxy_request(&req) {
        serve_request(&proxy, &mut ctx, req).await
    } else {
        serve_non_proxy(&proxy, &mut ctx, req).await
    }
}

fn is_proxy_request<B>(req: &Request<B>) -> bool {
    req.uri().scheme().is_some() && req.uri().authority().is_some()
}

/// Buffer the request body, refusing anything above `limit` bytes.
///
/// Chunked bodies are re-labelled with a `Content-Length`.
pub(crate) async fn read_body(req: Request<Incoming>, limit: usize) -> Result<Request<Bytes>> {
    if req.body().size_hint().lower() > limit as u64 {
        return Err(ProxyError::BodyTooLarge { limit });
    }

    let (mut parts, incoming) = req.into_parts();
    let collected = Limited::new(incoming, limit).collect().await.map_err(|e| {
        if e.is::<LengthLimitError>() {
            ProxyError::BodyTooLarge { limit }
        } else {
            ProxyError::malformed(format!("request body: {e}"))
        }
    })?;
    let bytes = collected.to_bytes();

    if parts.headers.remove(header::TRANSFER_ENCODING).is_some() {
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    }
    // The expectation was met when the body was read
    parts.headers.remove(header::EXPECT);
    Ok(Request::from_parts(parts, bytes))
}

/// Answer for a request whose body could not be read
pub(crate) fn body_error_response(err: &ProxyError) -> Response<Body> {
    let status = match err {
        ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    body::text_response(status, err.to_string())
}

/// Run one request through the pipeline and produce the client's answer
pub(crate) async fn serve_request(
    proxy: &Proxy,
    ctx: &mut ProxyCtx,
    mut req: Request<Incoming>,
) -> Result<Response<Body>> {
    let head_request = req.method() == Method::HEAD;
    let client_upgrade =
        http1::is_websocket_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let req = match read_body(req, proxy.limits().max_body_size).await {
        Ok(req) => req,
        Err(e) => {
            warn!(
                session = ctx.session(),
                uri = %ctx.req.uri,
                error = %e,
                "[HTTP] Cannot read request body"
            );
            return Ok(body_error_response(&e));
        }
    };

    let (mut req, canned) = filter_request(proxy, req.map(body::full), ctx).await;

    let response = match canned {
        Some(resp) => Some(resp),
        None => {
            http1::remove_proxy_headers(req.headers_mut(), proxy.keep_accept_encoding());
            debug!(
                session = ctx.session(),
                method = %req.method(),
                uri = %req.uri(),
                "[HTTP] Sending request upstream"
            );

            let transport = match &ctx.round_tripper {
                Some(custom) => Arc::clone(custom),
                None => proxy.transport(),
            };
            match transport.round_trip(req, ctx).await {
                Ok(resp) => {
                    ctx.resp = Some(ResponseInfo::from_response(&resp));
                    Some(resp)
                }
                Err(err) => {
                    warn!(
                        session = ctx.session(),
                        uri = %ctx.req.uri,
                        error = %err,
                        "[HTTP] Upstream round trip failed"
                    );
                    ctx.error = Some(Arc::new(err));
                    None
                }
            }
        }
    };

    let response = filter_response(proxy, response, ctx).await;
    let mut response = match response {
        Some(resp) => resp,
        None => {
            let message = ctx
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no response".to_string());
            body::text_response(StatusCode::BAD_GATEWAY, message)
        }
    };

    info!(
        session = ctx.session(),
        method = %ctx.req.method,
        uri = %ctx.req.uri,
        status = response.status().as_u16(),
        "[HTTP] Request completed"
    );

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        match client_upgrade {
            Some(client) => relay_upgrade(client, &mut response, ctx),
            None => warn!(
                session = ctx.session(),
                "[HTTP] 101 answered a request that asked for no upgrade"
            ),
        }
        return Ok(response);
    }

    http1::remove_response_hop_headers(response.headers_mut());
    sync_content_length(&mut response, head_request);
    Ok(response)
}

/// Answer a request that was not addressed to a proxy
pub(crate) async fn serve_non_proxy(
    proxy: &Proxy,
    ctx: &mut ProxyCtx,
    req: Request<Incoming>,
) -> Result<Response<Body>> {
    debug!(session = ctx.session(), uri = %req.uri(), "Non-proxy request");

    let req = match read_body(req, proxy.limits().max_body_size).await {
        Ok(req) => req,
        Err(e) => return Ok(body_error_response(&e)),
    };
    let response = match proxy.non_proxy_handler() {
        Some(handler) => handler.handle_request(req.map(body::full), ctx).await.1,
        None => None,
    };
    Ok(response
        .unwrap_or_else(|| body::text_response(StatusCode::INTERNAL_SERVER_ERROR, NON_PROXY_MESSAGE)))
}

async fn filter_request(
    proxy: &Proxy,
    mut req: Request<Body>,
    ctx: &mut ProxyCtx,
) -> (Request<Body>, Option<Response<Body>>) {
    for route in proxy.request_routes() {
        ctx.req = RequestInfo::from_request(&req);
        if !route.matches(&ctx.req, ctx) {
            continue;
        }
        let (next, resp) = route.handler.handle_request(req, ctx).await;
        req = next;
        if resp.is_some() {
            ctx.req = RequestInfo::from_request(&req);
            return (req, resp);
        }
    }
    ctx.req = RequestInfo::from_request(&req);
    (req, None)
}

async fn filter_response(
    proxy: &Proxy,
    mut resp: Option<Response<Body>>,
    ctx: &mut ProxyCtx,
) -> Option<Response<Body>> {
    for route in proxy.response_routes() {
        if !route.matches(resp.as_ref(), ctx) {
            continue;
        }
        resp = route.handler.handle_response(resp, ctx).await;
        ctx.resp = resp.as_ref().map(ResponseInfo::from_response);
    }
    resp
}

/// Bodies of known size replace whatever `Content-Length` a handler left behind
fn sync_content_length(response: &mut Response<Body>, head_request: bool) {
    let status = response.status();
    if head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return;
    }
    match response.body().size_hint().exact() {
        Some(len) => {
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        None => {
            response.headers_mut().remove(header::CONTENT_LENGTH);
        }
    }
}

/// Splice the client and upstream connections once the `101` is written
fn relay_upgrade(client: OnUpgrade, response: &mut Response<Body>, ctx: &ProxyCtx) {
    let upstream = hyper::upgrade::on(response);
    let session = ctx.session();
    let uri = ctx.req.uri.clone();

    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(session, error = %e, "[HTTP] Upgrade did not complete");
                return;
            }
        };

        let started = Instant::now();
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((client_to_server, server_to_client)) => info!(
                session,
                uri = %uri,
                client_to_server,
                server_to_client,
                duration_ms = started.elapsed().as_millis() as u64,
                "[HTTP] Upgraded connection closed"
            ),
            Err(e) => debug!(session, error = %e, "[HTTP] Upgraded relay ended"),
        }
    });
}
