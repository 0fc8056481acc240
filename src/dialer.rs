//! Upstream dialing for CONNECT tunnels and origin connections
//!
//! A [`ConnectDialer`] either connects straight to the target, or opens a
//! CONNECT tunnel through another proxy (fixed, or picked from the usual
//! `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY` environment variables).

use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::HeaderValue;
use ipnetwork::IpNetwork;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::mitm::{parse_server_name, UpstreamTlsConfig};
use crate::stream::BoxStream;

/// Longest CONNECT response head accepted from an upstream proxy
const MAX_PROXY_RESPONSE: u64 = 16 * 1024;

/// Next-hop proxy reached with CONNECT
#[derive(Clone)]
pub struct UpstreamProxy {
    authority: String,
    host: String,
    tls: Option<UpstreamTlsConfig>,
    authorization: Option<HeaderValue>,
}

impl UpstreamProxy {
    /// Parse `http://[user:pass@]host[:port]` or `https://...`.
    ///
    /// A missing scheme means `http`. Credentials become a Basic
    /// `Proxy-Authorization` header on every CONNECT.
    pub fn parse(raw: &str) -> Result<Self> {
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&with_scheme)
            .map_err(|e| ProxyError::InvalidUri(format!("{raw}: {e}")))?;

        let tls = match url.scheme() {
            "http" => None,
            "https" => Some(UpstreamTlsConfig::new()?),
            other => {
                return Err(ProxyError::InvalidUri(format!(
                    "{raw}: unsupported proxy scheme {other}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUri(format!("{raw}: missing host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidUri(format!("{raw}: missing port")))?;

        let authorization = if url.username().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            let value = format!("Basic {}", STANDARD.encode(credentials));
            Some(HeaderValue::from_str(&value).map_err(|e| ProxyError::InvalidUri(e.to_string()))?)
        };

        Ok(Self {
            authority: format!("{host}:{port}"),
            host,
            tls,
            authorization,
        })
    }

    /// Trust this config when the proxy itself speaks TLS
    pub fn with_tls_config(mut self, tls: UpstreamTlsConfig) -> Self {
        if self.tls.is_some() {
            self.tls = Some(tls);
        }
        self
    }

    /// `host:port` of the proxy
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub(crate) fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    /// Open a tunnel to `addr` through this proxy
    pub async fn connect(&self, addr: &str, timeout: Duration) -> Result<BoxStream> {
        let tcp = dial_direct(&self.authority, timeout).await?;
        let stream: BoxStream = match &self.tls {
            Some(tls) => {
                let name = parse_server_name(&self.host)?;
                let tls_stream = TlsConnector::from(tls.client_config())
                    .connect(name, tcp)
                    .await
                    .map_err(|e| ProxyError::Tls(format!("{}: {e}", self.authority)))?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let mut stream = BufReader::new(stream);
        let mut request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n");
        if let Some(auth) = &self.authorization {
            request.push_str("Proxy-Authorization: ");
            request.push_str(auth.to_str().unwrap_or_default());
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let status = read_connect_status(&mut stream).await?;
        if !(200..300).contains(&status.0) {
            return Err(ProxyError::UpstreamProxy {
                proxy: self.authority.clone(),
                status: status.1,
            });
        }

        debug!(proxy = %self.authority, target = %addr, "Tunnel opened through upstream proxy");
        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("authority", &self.authority)
            .field("tls", &self.tls.is_some())
            .field("authorization", &self.authorization.is_some())
            .finish()
    }
}

/// Read the upstream proxy's response head; returns code and status line
async fn read_connect_status<R>(reader: &mut R) -> Result<(u16, String)>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut head = Vec::new();
    loop {
        let remaining = MAX_PROXY_RESPONSE.saturating_sub(head.len() as u64);
        if remaining == 0 {
            return Err(ProxyError::malformed("upstream proxy response too large"));
        }
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            return Err(ProxyError::malformed("upstream proxy closed during CONNECT"));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(&head)
        .map_err(|e| ProxyError::malformed(format!("upstream proxy response: {e}")))?;
    let code = resp
        .code
        .ok_or_else(|| ProxyError::malformed("upstream proxy response without status"))?;
    let line = format!("{code} {}", resp.reason.unwrap_or(""));
    Ok((code, line.trim_end().to_string()))
}

/// TCP connect bounded by `timeout`
pub async fn dial_direct(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::DialTimeout {
            addr: addr.to_string(),
        })?
        .map_err(|e| ProxyError::dial(addr, e))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// How the proxy reaches CONNECT targets and HTTPS origins
#[derive(Clone, Debug, Default)]
pub enum ConnectDialer {
    /// Connect straight to the target
    #[default]
    Direct,
    /// Always tunnel through the given proxy
    Proxy(UpstreamProxy),
    /// Follow `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY`
    Env(ProxyEnv),
}

impl ConnectDialer {
    pub fn via_proxy(url: &str) -> Result<Self> {
        Ok(Self::Proxy(UpstreamProxy::parse(url)?))
    }

    pub fn from_env() -> Self {
        Self::Env(ProxyEnv::from_env())
    }

    /// Connect to `addr` (`host:port`), possibly through the next hop
    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxStream> {
        match self {
            Self::Direct => Ok(Box::new(dial_direct(addr, timeout).await?)),
            Self::Proxy(proxy) => proxy.connect(addr, timeout).await,
            Self::Env(env) => match env.https_proxy_for(addr) {
                Some(raw) => UpstreamProxy::parse(raw)?.connect(addr, timeout).await,
                None => Ok(Box::new(dial_direct(addr, timeout).await?)),
            },
        }
    }

    /// Forward proxy for plain-HTTP requests to `addr`, if any
    pub fn http_proxy_for(&self, addr: &str) -> Option<UpstreamProxy> {
        match self {
            Self::Env(env) => env.http_proxy_for(addr).and_then(|raw| UpstreamProxy::parse(raw).ok()),
            _ => None,
        }
    }
}

/// Proxy settings from the environment
#[derive(Clone, Debug, Default)]
pub struct ProxyEnv {
    pub https_proxy: Option<String>,
    pub http_proxy: Option<String>,
    pub no_proxy: NoProxy,
}

impl ProxyEnv {
    /// Upper-case variables win over lower-case ones
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|v| !v.trim().is_empty())
        };
        Self {
            https_proxy: get("HTTPS_PROXY", "https_proxy"),
            http_proxy: get("HTTP_PROXY", "http_proxy"),
            no_proxy: get("NO_PROXY", "no_proxy")
                .map(|v| NoProxy::parse(&v))
                .unwrap_or_default(),
        }
    }

    pub fn https_proxy_for(&self, addr: &str) -> Option<&str> {
        if self.no_proxy.matches(addr) {
            return None;
        }
        self.https_proxy.as_deref()
    }

    pub fn http_proxy_for(&self, addr: &str) -> Option<&str> {
        if self.no_proxy.matches(addr) {
            return None;
        }
        self.http_proxy.as_deref()
    }
}

/// `NO_PROXY` exclusion list
#[derive(Clone, Debug, Default)]
pub struct NoProxy {
    all: bool,
    networks: Vec<IpNetwork>,
    domains: Vec<DomainRule>,
}

#[derive(Clone, Debug)]
struct DomainRule {
    name: String,
    port: Option<u16>,
    subdomains_only: bool,
}

impl NoProxy {
    /// Comma-separated entries: `*`, IPs, CIDRs, `host`, `.suffix` or
    /// `*.suffix`, each optionally followed by `:port`
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let entry = entry.to_ascii_lowercase();
            if entry == "*" {
                list.all = true;
                continue;
            }
            if let Ok(network) = IpNetwork::from_str(entry.trim_start_matches('[').trim_end_matches(']')) {
                list.networks.push(network);
                continue;
            }

            let (name, port) = split_host_port(&entry);
            if let Ok(ip) = name.parse::<IpAddr>() {
                list.networks.push(IpNetwork::from(ip));
                continue;
            }
            let (name, subdomains_only) = match name.strip_prefix("*.") {
                Some(rest) => (format!(".{rest}"), true),
                None => (name.to_string(), name.starts_with('.')),
            };
            list.domains.push(DomainRule {
                name,
                port,
                subdomains_only,
            });
        }
        list
    }

    /// Whether `addr` (`host` or `host:port`) bypasses the proxy
    pub fn matches(&self, addr: &str) -> bool {
        if self.all {
            return true;
        }
        let (host, port) = split_host_port(addr);
        let host = host.to_ascii_lowercase();

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.networks.iter().any(|net| net.contains(ip));
        }

        self.domains.iter().any(|rule| {
            if rule.port.is_some() && rule.port != port {
                return false;
            }
            if rule.subdomains_only {
                host.ends_with(&rule.name)
            } else {
                host == rule.name || host.ends_with(&format!(".{}", rule.name))
            }
        })
    }
}

/// Split `host:port`, `[v6]:port`, `[v6]` or a bare host
fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (addr, None),
        };
    }
    match addr.rsplit_once(':') {
        // More than one colon is a bare IPv6 literal
        Some((host, _)) if host.contains(':') => (addr, None),
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (addr, None),
        },
        None => (addr, None),
    }
}
