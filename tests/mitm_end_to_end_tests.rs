//! MITM End-to-End Tests
//!
//! Real HTTPS and HTTP requests through one or two proxies, against local
//! origins.

mod common;

use std::time::Duration;

use async_trait::async_trait;
use http::{header, Response, StatusCode};
use http_body_util::BodyExt;
use interpose::conditions::{request_matched, url_has_prefix};
use interpose::mitm::parse_server_name;
use interpose::{
    body, AlwaysMitm, Body, ConnectDialer, Limits, ProxyCtx, ProxyOptions, ResponseHandler,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

/// Repeats the upstream body twice, separated by a space
struct Doubler;

#[async_trait]
impl ResponseHandler for Doubler {
    async fn handle_response(
        &self,
        resp: Option<Response<Body>>,
        _ctx: &mut ProxyCtx,
    ) -> Option<Response<Body>> {
        let (mut parts, body) = resp?.into_parts();
        let bytes = body.collect().await.ok()?.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        parts.headers.remove(header::CONTENT_LENGTH);
        Some(Response::from_parts(parts, body::full(format!("{text} {text}"))))
    }
}

// ============================================================================
// HTTPS interception
// ============================================================================

#[tokio::test]
async fn test_mitm_serves_origin_content_with_forged_certificate() {
    let origin = common::spawn_https_origin().await;
    let proxy_ca = common::test_ca("Proxy CA");

    let proxy = common::builder(&proxy_ca)
        .upstream_tls(common::trusting(&origin.ca))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;

    let client = common::client_via(proxy_addr, &proxy_ca);
    let resp = client
        .get(format!("https://{}/bobo", origin.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let presented = resp
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .map(|der| der.to_vec())
        .unwrap();
    assert_ne!(presented, origin.leaf.to_vec(), "client saw the origin certificate");

    let (_, leaf) = X509Certificate::from_der(&presented).unwrap();
    let (_, ca) = X509Certificate::from_der(proxy_ca.cert_der()).unwrap();
    assert_eq!(leaf.issuer(), ca.subject());

    assert_eq!(resp.text().await.unwrap(), "bobo");
}

#[tokio::test]
async fn test_keep_alive_inside_intercepted_tunnel() {
    let origin = common::spawn_https_origin().await;
    let proxy_ca = common::test_ca("Proxy CA");

    let proxy = common::builder(&proxy_ca)
        .upstream_tls(common::trusting(&origin.ca))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;
    let client = common::client_via(proxy_addr, &proxy_ca);

    for path in ["/bobo", "/second", "/third"] {
        let resp = client
            .get(format!("https://{}{}", origin.addr, path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let text = resp.text().await.unwrap();
        if path == "/bobo" {
            assert_eq!(text, "bobo");
        } else {
            assert_eq!(text, format!("path={path}"));
        }
    }
}

#[tokio::test]
async fn test_chained_proxies_both_intercept() {
    let origin = common::spawn_https_origin().await;
    let first_ca = common::test_ca("First Proxy CA");
    let second_ca = common::test_ca("Second Proxy CA");

    // First hop talks to the origin and doubles every body
    let first = common::builder(&first_ca)
        .upstream_tls(common::trusting(&origin.ca))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .on_response([])
        .handle(Doubler)
        .build()
        .unwrap();
    let first_addr = common::spawn_proxy(first).await;

    // Second hop reaches HTTPS origins through the first one
    let second = common::builder(&second_ca)
        .connect_dialer(ConnectDialer::via_proxy(&format!("http://{first_addr}")).unwrap())
        .upstream_tls(common::trusting(&first_ca))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .build()
        .unwrap();
    let second_addr = common::spawn_proxy(second).await;

    let client = common::client_via(second_addr, &second_ca);
    let text = client
        .get(format!("https://{}/bobo", origin.addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "bobo bobo");
}

#[tokio::test]
async fn test_untrusted_origin_yields_bad_gateway() {
    let origin = common::spawn_https_origin().await;
    let proxy_ca = common::test_ca("Proxy CA");

    // Origin CA deliberately not trusted upstream
    let proxy = common::builder(&proxy_ca)
        .upstream_tls(common::trusting(&proxy_ca))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;

    let client = common::client_via(proxy_addr, &proxy_ca);
    let resp = client
        .get(format!("https://{}/bobo", origin.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

// ============================================================================
// Plain HTTP
// ============================================================================

#[tokio::test]
async fn test_plain_http_filtering() {
    let origin = common::spawn_http_origin().await;
    let ca = common::test_ca("Proxy CA");
    let blocked_prefix = format!("{origin}/admin");

    let proxy = common::builder(&ca)
        .on_request([url_has_prefix(blocked_prefix.clone())])
        .handle_fn(|req, _ctx| {
            let resp = body::text_response(StatusCode::FORBIDDEN, "admin is off limits");
            (req, Some(resp))
        })
        .on_response([request_matched(url_has_prefix(format!("{origin}/bobo")))])
        .handle_fn(|resp, _ctx| {
            resp.map(|mut r| {
                r.headers_mut()
                    .insert("x-intercepted", "yes".parse().unwrap());
                r
            })
        })
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;
    let client = common::client_via(proxy_addr, &ca);

    let resp = client.get(format!("http://{origin}/bobo")).send().await.unwrap();
    assert_eq!(resp.headers()["x-intercepted"], "yes");
    assert_eq!(resp.text().await.unwrap(), "bobo");

    let resp = client.get(format!("http://{origin}/admin/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.text().await.unwrap(), "admin is off limits");

    let resp = client.get(format!("http://{origin}/other")).send().await.unwrap();
    assert!(resp.headers().get("x-intercepted").is_none());
}

#[tokio::test]
async fn test_proxy_headers_are_stripped() {
    let origin = common::spawn_http_origin().await;
    let ca = common::test_ca("Proxy CA");
    let proxy = common::builder(&ca).build().unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/headers HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Proxy-Connection: keep-alive\r\n\
         Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
         Accept-Encoding: gzip\r\n\
         X-Custom: kept\r\n\
         Connection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();

    let (_, seen) = out.split_once("\r\n\r\n").unwrap();
    let seen = seen.to_ascii_lowercase();
    assert!(seen.contains("x-custom=kept"), "{seen}");
    assert!(!seen.contains("proxy-connection"));
    assert!(!seen.contains("proxy-authorization"));
    assert!(!seen.contains("accept-encoding"));
}

// ============================================================================
// WebSocket upgrade
// ============================================================================

#[tokio::test]
async fn test_websocket_upgrade_is_relayed() {
    // Origin accepting any upgrade and echoing afterwards
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = common::read_head(&mut socket).await;
        assert!(head.to_ascii_lowercase().contains("upgrade: websocket"), "{head}");
        socket
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();
        let (mut read, mut write) = socket.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
    });

    let ca = common::test_ca("Proxy CA");
    let proxy = common::builder(&ca).build().unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/ws HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 "), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: websocket"));

    stream.write_all(b"frame-bytes").await.unwrap();
    let mut echoed = [0u8; 11];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"frame-bytes");
}

#[tokio::test]
async fn test_handlers_share_user_data_across_tunnel() {
    let origin = common::spawn_https_origin().await;
    let proxy_ca = common::test_ca("Proxy CA");

    let proxy = common::builder(&proxy_ca)
        .upstream_tls(common::trusting(&origin.ca))
        .on_request([])
        .handle_connect_fn(|host, ctx| {
            ctx.set_user_data(format!("tunnel:{}", ctx.session()));
            Some((interpose::ConnectAction::mitm(), host.to_string()))
        })
        .on_response([])
        .handle_fn(|resp, ctx| {
            let tag = ctx.user_data::<String>().cloned().unwrap_or_default();
            resp.map(|mut r| {
                r.headers_mut().insert("x-tunnel", tag.parse().unwrap());
                r
            })
        })
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;
    let client = common::client_via(proxy_addr, &proxy_ca);

    let resp = client
        .get(format!("https://{}/bobo", origin.addr))
        .send()
        .await
        .unwrap();
    let tag = resp.headers()["x-tunnel"].to_str().unwrap().to_string();
    assert!(tag.starts_with("tunnel:"), "{tag}");
    assert_eq!(resp.text().await.unwrap(), "bobo");
}

// ============================================================================
// Request bodies
// ============================================================================

#[tokio::test]
async fn test_expect_continue_gets_interim_response() {
    let origin = common::spawn_http_origin().await;
    let ca = common::test_ca("Proxy CA");
    let proxy_addr = common::spawn_proxy(common::builder(&ca).build().unwrap()).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let head = format!(
        "POST http://{origin}/echo HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Content-Length: 5\r\n\
         Expect: 100-continue\r\n\
         Connection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await.unwrap();

    // Nothing but the head has been sent; the proxy must ask for the body
    let interim = tokio::time::timeout(Duration::from_secs(5), common::read_head(&mut stream))
        .await
        .expect("no 100 Continue");
    assert!(interim.starts_with("HTTP/1.1 100 Continue\r\n"), "{interim}");

    stream.write_all(b"hello").await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("\r\n\r\nhello"), "{out}");
}

#[tokio::test]
async fn test_overflowing_chunk_size_does_not_take_down_the_proxy() {
    let origin = common::spawn_http_origin().await;
    let ca = common::test_ca("Proxy CA");
    let proxy_addr = common::spawn_proxy(common::builder(&ca).build().unwrap()).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "POST http://{origin}/echo HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Transfer-Encoding: chunked\r\n\r\n\
         1\r\na\r\nffffffffffffffffff\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");

    let client = common::client_via(proxy_addr, &ca);
    let resp = client.get(format!("http://{origin}/bobo")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "bobo");
}

#[tokio::test]
async fn test_oversized_chunked_body_is_refused() {
    let origin = common::spawn_http_origin().await;
    let ca = common::test_ca("Proxy CA");
    let proxy = common::builder(&ca)
        .options(ProxyOptions {
            limits: Limits {
                max_header_size: 64 * 1024,
                max_body_size: 16,
            },
            ..ProxyOptions::default()
        })
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;
    let client = common::client_via(proxy_addr, &ca);

    let small = client
        .post(format!("http://{origin}/echo"))
        .body("within limit")
        .send()
        .await
        .unwrap();
    assert_eq!(small.text().await.unwrap(), "within limit");

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "POST http://{origin}/echo HTTP/1.1\r\n\
         Host: {origin}\r\n\
         Transfer-Encoding: chunked\r\n\r\n\
         a\r\n0123456789\r\na\r\n0123456789\r\n0\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{head}");
}

// ============================================================================
// Idle connections
// ============================================================================

#[tokio::test]
async fn test_idle_keep_alive_tunnel_is_closed() {
    let origin = common::spawn_https_origin().await;
    let proxy_ca = common::test_ca("Proxy CA");
    let proxy = common::builder(&proxy_ca)
        .upstream_tls(common::trusting(&origin.ca))
        .idle_timeout(Some(Duration::from_millis(300)))
        .on_request([])
        .handle_connect(AlwaysMitm)
        .build()
        .unwrap();
    let proxy_addr = common::spawn_proxy(proxy).await;

    let (stream, head) = common::connect(proxy_addr, &origin.addr.to_string()).await;
    assert_eq!(head, "HTTP/1.0 200 OK\r\n\r\n");
    let tls = common::trusting(&proxy_ca);
    let mut tls_stream = TlsConnector::from(tls.client_config())
        .connect(parse_server_name("127.0.0.1").unwrap(), stream)
        .await
        .unwrap();

    tls_stream
        .write_all(b"GET /bobo HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();
    let head = common::read_head(&mut tls_stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let mut body = [0u8; 4];
    tls_stream.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"bobo");

    // Keep-alive: the tunnel stays open until the idle timer fires
    let mut rest = [0u8; 1];
    let closed = tokio::time::timeout(Duration::from_secs(5), tls_stream.read(&mut rest)).await;
    assert!(
        matches!(closed, Ok(Ok(0)) | Ok(Err(_))),
        "idle tunnel still open: {closed:?}"
    );
}
