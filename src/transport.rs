//! Upstream round trips
//!
//! The default [`HttpTransport`] opens one HTTP/1.1 client connection per
//! request: TLS (verified against the Mozilla roots plus any extra roots) for
//! `https` URLs, plain TCP for `http`. Plain requests are sent in absolute
//! form to an `HTTP_PROXY` when the dialer follows the environment.

use std::time::Duration;

use async_trait::async_trait;
use http::uri::{Authority, PathAndQuery};
use http::{header, HeaderValue, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::body::{Body, BoxError};
use crate::ctx::ProxyCtx;
use crate::dialer::{dial_direct, ConnectDialer, UpstreamProxy};
use crate::error::{ProxyError, Result};
use crate::mitm::{parse_server_name, UpstreamTlsConfig};
use crate::stream::BoxStream;

/// Sends a request upstream and returns the response head with a streaming body
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: Request<Body>, ctx: &ProxyCtx) -> Result<Response<Body>>;
}

/// Default upstream client
#[derive(Clone)]
pub struct HttpTransport {
    dialer: ConnectDialer,
    tls: UpstreamTlsConfig,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(dialer: ConnectDialer, tls: UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            tls,
            connect_timeout,
        }
    }

    /// Connect for `uri`; also returns the forward proxy when one is in use
    async fn open(&self, uri: &Uri) -> Result<(BoxStream, Option<UpstreamProxy>)> {
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::InvalidUri(format!("{uri}: missing host")))?;
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let addr = format!("{host}:{port}");

        if https {
            let tcp = self.dialer.dial(&addr, self.connect_timeout).await?;
            let name = parse_server_name(host)?;
            let tls = TlsConnector::from(self.tls.client_config())
                .connect(name, tcp)
                .await
                .map_err(|e| ProxyError::Tls(format!("{addr}: {e}")))?;
            return Ok((Box::new(tls), None));
        }

        match self.dialer.http_proxy_for(&addr) {
            Some(proxy) => {
                let stream = dial_direct(proxy.authority(), self.connect_timeout).await?;
                Ok((Box::new(stream), Some(proxy)))
            }
            None => Ok((self.dialer.dial(&addr, self.connect_timeout).await?, None)),
        }
    }
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, mut req: Request<Body>, ctx: &ProxyCtx) -> Result<Response<Body>> {
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidUri(format!("{uri}: not absolute")))?;

        let (stream, forward_proxy) = self.open(&uri).await?;

        set_host(&mut req, &authority);
        match forward_proxy {
            Some(proxy) => {
                if let Some(value) = proxy.authorization() {
                    req.headers_mut()
                        .insert(header::PROXY_AUTHORIZATION, value.clone());
                }
            }
            None => {
                let path = uri
                    .path_and_query()
                    .cloned()
                    .unwrap_or_else(|| PathAndQuery::from_static("/"));
                *req.uri_mut() = Uri::from(path);
            }
        }

        let (mut sender, conn) = http1::Builder::new()
            .title_case_headers(true)
            .handshake::<_, Body>(TokioIo::new(stream))
            .await?;

        let session = ctx.session();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(session, error = %e, "Upstream connection ended with error");
            }
        });

        let resp = sender.send_request(req).await?;
        Ok(resp.map(|body| body.map_err(BoxError::from).boxed()))
    }
}

fn set_host(req: &mut Request<Body>, authority: &Authority) {
    if req.headers().contains_key(header::HOST) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        req.headers_mut().insert(header::HOST, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use crate::ctx::RequestInfo;
    use crate::server::Proxy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_round_trip_uses_origin_form() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let origin = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbobo")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let proxy = Proxy::builder().build().unwrap();
        let uri = format!("http://{addr}/bobo?x=1");
        let req = Request::get(&uri).body(body::empty()).unwrap();
        let ctx = ProxyCtx::new(&proxy, addr, RequestInfo::from_request(&req));

        let transport = HttpTransport::new(
            ConnectDialer::Direct,
            UpstreamTlsConfig::new().unwrap(),
            Duration::from_secs(5),
        );
        let resp = transport.round_trip(req, &ctx).await.unwrap();
        assert_eq!(resp.status(), 200);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"bobo");

        let seen = origin.await.unwrap();
        assert!(seen.starts_with("GET /bobo?x=1 HTTP/1.1\r\n"), "{seen}");
        assert!(seen.contains(&format!("Host: {addr}\r\n")));
    }

    #[tokio::test]
    async fn test_round_trip_requires_absolute_uri() {
        let proxy = Proxy::builder().build().unwrap();
        let req = Request::get("/relative").body(body::empty()).unwrap();
        let ctx = ProxyCtx::new(
            &proxy,
            "127.0.0.1:1".parse().unwrap(),
            RequestInfo::from_request(&req),
        );
        let transport = HttpTransport::new(
            ConnectDialer::Direct,
            UpstreamTlsConfig::new().unwrap(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            transport.round_trip(req, &ctx).await,
            Err(ProxyError::InvalidUri(_))
        ));
    }
}
