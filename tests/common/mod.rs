//! Shared fixtures for integration tests
//!
//! Origins are small hyper servers answering a fixed set of paths.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use interpose::body;
use interpose::mitm::{sign_host, CaConfig, CertificateAuthority, SigningRequest};
use interpose::{Body, ConnectDialer, Proxy, ProxyBuilder, UpstreamTlsConfig};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Fresh CA with its own subject
pub fn test_ca(name: &str) -> Arc<CertificateAuthority> {
    let config = CaConfig {
        common_name: name.to_string(),
        ..CaConfig::default()
    };
    Arc::new(CertificateAuthority::generate(&config).unwrap())
}

/// Answers `/bobo` with `bobo`, echoes the request path otherwise
pub fn default_routes(req: &Request<Bytes>) -> Response<Body> {
    match req.uri().path() {
        "/bobo" => Response::new(body::full("bobo")),
        "/echo" => Response::new(body::full(req.body().clone())),
        "/headers" => {
            let seen: Vec<String> = req
                .headers()
                .iter()
                .map(|(name, value)| format!("{}={}", name, value.to_str().unwrap_or("?")))
                .collect();
            Response::new(body::full(seen.join("\n")))
        }
        path => {
            let mut resp = Response::new(body::full(format!("path={path}")));
            *resp.status_mut() = StatusCode::OK;
            resp
        }
    }
}

async fn origin_service(req: Request<Incoming>) -> Result<Response<Body>, hyper::Error> {
    let (parts, incoming) = req.into_parts();
    let bytes = incoming.collect().await?.to_bytes();
    Ok(default_routes(&Request::from_parts(parts, bytes)))
}

async fn serve_origin_conn<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let served = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service_fn(origin_service))
        .await;
    if let Err(e) = served {
        eprintln!("origin connection error: {e}");
    }
}

/// Plain HTTP origin on 127.0.0.1
pub async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin_conn(stream));
        }
    });
    addr
}

/// HTTPS origin on 127.0.0.1 with a certificate from its own CA
pub struct HttpsOrigin {
    pub addr: SocketAddr,
    pub ca: Arc<CertificateAuthority>,
    pub leaf: CertificateDer<'static>,
}

pub async fn spawn_https_origin() -> HttpsOrigin {
    let ca = test_ca("Test Origin CA");
    let request = SigningRequest::new(["127.0.0.1", "localhost"]).unwrap();
    let leaf = sign_host(&ca, &request).unwrap();
    let acceptor = TlsAcceptor::from(leaf.server_config());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_origin_conn(tls).await;
                }
            });
        }
    });

    HttpsOrigin {
        addr,
        ca,
        leaf: leaf.leaf_der().clone(),
    }
}

/// TCP echo server
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Builder with a direct dialer, so host proxy settings never leak in
pub fn builder(ca: &Arc<CertificateAuthority>) -> ProxyBuilder {
    Proxy::builder()
        .ca(Arc::clone(ca))
        .connect_dialer(ConnectDialer::Direct)
}

/// Upstream TLS trusting the given CA in addition to the public roots
pub fn trusting(ca: &CertificateAuthority) -> UpstreamTlsConfig {
    UpstreamTlsConfig::with_extra_roots(vec![ca.cert_der().clone()]).unwrap()
}

/// Serve `proxy` on an ephemeral port
pub async fn spawn_proxy(proxy: Proxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });
    addr
}

/// reqwest client going through `proxy` and trusting `ca`
pub fn client_via(proxy: SocketAddr, ca: &CertificateAuthority) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).unwrap())
        .add_root_certificate(reqwest::Certificate::from_der(ca.cert_der()).unwrap())
        .tls_info(true)
        .build()
        .unwrap()
}

/// Read a response head byte by byte, leaving the stream right after it
pub async fn read_head<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Send a CONNECT and return the connection with the proxy's answer head
pub async fn connect(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    (stream, head)
}
