//! TLS Configuration for both legs of an intercepted connection
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) presenting forged leaf certificates
//! - Upstream TLS (proxy → origin) with real verification
//!
//! Both sides pin the ring provider and TLS 1.2/1.3, and negotiate
//! `http/1.1` only: the interception loop speaks HTTP/1.x.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

use super::ca::CertificateAuthority;
use super::cert_store::{CertStorage, NoCertCache};
use super::error::{MitmError, Result};
use super::signer::{sign_host, SigningRequest};
use crate::ctx::ProxyCtx;

const HTTP11_ALPN: &[u8] = b"http/1.1";

fn ring_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client-facing TLS config (proxy acts as server with forged cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config for a `[leaf, ca]` chain
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let mut config = ServerConfig::builder_with_provider(ring_provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(MitmError::tls_config)?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(MitmError::tls_config)?;

        config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Client config trusting the Mozilla root bundle
    pub fn new() -> Result<Self> {
        Self::with_extra_roots(Vec::new())
    }

    /// Client config trusting the Mozilla bundle plus `extra_roots`
    pub fn with_extra_roots(extra_roots: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            root_store.add(root).map_err(MitmError::tls_config)?;
        }

        let mut config = ClientConfig::builder_with_provider(ring_provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(MitmError::tls_config)?
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

        debug!(roots_count = TLS_SERVER_ROOTS.len(), "Upstream TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap an existing rustls client config
    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Get rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// Parse hostname into ServerName for SNI
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(bare.to_owned()).map_err(|e| MitmError::InvalidHost(e.to_string()))
}

/// Produces the client-facing TLS config for an intercepted CONNECT
#[async_trait]
pub trait TlsConfigSource: Send + Sync {
    async fn server_config(
        &self,
        request: &SigningRequest,
        ctx: &ProxyCtx,
    ) -> Result<Arc<ServerConfig>>;
}

/// Default source: leaves signed by a CA, memoized through a [`CertStorage`]
pub struct CaTlsConfig {
    ca: Arc<CertificateAuthority>,
    store: Arc<dyn CertStorage>,
}

impl CaTlsConfig {
    pub fn new(ca: Arc<CertificateAuthority>, store: Arc<dyn CertStorage>) -> Self {
        Self { ca, store }
    }

    /// Sign on every handshake
    pub fn uncached(ca: Arc<CertificateAuthority>) -> Self {
        Self::new(ca, Arc::new(NoCertCache))
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

#[async_trait]
impl TlsConfigSource for CaTlsConfig {
    async fn server_config(
        &self,
        request: &SigningRequest,
        _ctx: &ProxyCtx,
    ) -> Result<Arc<ServerConfig>> {
        let ca = &self.ca;
        let generate = || sign_host(ca, request).map(Arc::new);
        let leaf = self.store.fetch(&request.cache_key(), &generate).await?;
        Ok(leaf.server_config())
    }
}
