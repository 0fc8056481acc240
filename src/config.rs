use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::handlers::AlwaysMitm;
use crate::mitm::{CertStorage, CertificateAuthority, ExpiringCertStore, LruCertStore, NoCertCache};
use crate::server::{Limits, ProxyBuilder, ProxyOptions};

/// Leaf certificate cache flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertCacheBackend {
    Expiring,
    Lru,
    None,
}

impl FromStr for CertCacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expiring" | "ttl" => Ok(Self::Expiring),
            "lru" => Ok(Self::Lru),
            "none" | "off" => Ok(Self::None),
            other => Err(anyhow::anyhow!(
                "unknown certificate cache backend '{}' (expected expiring, lru or none)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,

    // CA paths (both or neither; neither means the bundled CA)
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,

    // Interception policy
    pub mitm_all: bool,
    pub keep_accept_encoding: bool,

    // Certificate cache
    pub cert_cache_backend: CertCacheBackend,
    pub cert_cache_ttl_seconds: u64,
    pub cert_cache_sweep_seconds: u64,
    pub cert_cache_capacity: usize,

    // Limits and timeouts
    pub max_request_body_size: usize,
    pub max_header_size: usize,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ca_cert_path: None,
            ca_key_path: None,
            mitm_all: false,
            keep_accept_encoding: false,
            cert_cache_backend: CertCacheBackend::Expiring,
            cert_cache_ttl_seconds: 3600,
            cert_cache_sweep_seconds: 1,
            cert_cache_capacity: 1000,
            max_request_body_size: 10 * 1024 * 1024,
            max_header_size: 64 * 1024,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 120,
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_path(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = var_or("PROXY_HOST", "0.0.0.0");
        let port = var_or("PROXY_PORT", "8080")
            .parse()
            .context("Invalid PROXY_PORT")?;

        let ca_cert_path = optional_path("MITM_CA_CERT_PATH");
        let ca_key_path = optional_path("MITM_CA_KEY_PATH");

        let mitm_all = var_or("MITM_ALL", "false")
            .parse()
            .context("Invalid MITM_ALL")?;
        let keep_accept_encoding = var_or("KEEP_ACCEPT_ENCODING", "false")
            .parse()
            .context("Invalid KEEP_ACCEPT_ENCODING")?;

        let cert_cache_backend = var_or("CERT_CACHE_BACKEND", "expiring")
            .parse()
            .context("Invalid CERT_CACHE_BACKEND")?;
        let cert_cache_ttl_seconds = var_or("CERT_CACHE_TTL_SECONDS", "3600")
            .parse()
            .context("Invalid CERT_CACHE_TTL_SECONDS")?;
        let cert_cache_sweep_seconds = var_or("CERT_CACHE_SWEEP_SECONDS", "1")
            .parse()
            .context("Invalid CERT_CACHE_SWEEP_SECONDS")?;
        let cert_cache_capacity = var_or("CERT_CACHE_CAPACITY", "1000")
            .parse()
            .context("Invalid CERT_CACHE_CAPACITY")?;

        let max_request_body_size = var_or("MAX_REQUEST_BODY_SIZE", "10485760") // 10MB default
            .parse()
            .context("Invalid MAX_REQUEST_BODY_SIZE")?;
        let max_header_size = var_or("MAX_HEADER_SIZE", "65536")
            .parse()
            .context("Invalid MAX_HEADER_SIZE")?;
        let connect_timeout_seconds = var_or("CONNECT_TIMEOUT_SECONDS", "10")
            .parse()
            .context("Invalid CONNECT_TIMEOUT_SECONDS")?;
        let idle_timeout_seconds = var_or("IDLE_TIMEOUT_SECONDS", "120")
            .parse()
            .context("Invalid IDLE_TIMEOUT_SECONDS")?;

        let config = Self {
            host,
            port,
            ca_cert_path,
            ca_key_path,
            mitm_all,
            keep_accept_encoding,
            cert_cache_backend,
            cert_cache_ttl_seconds,
            cert_cache_sweep_seconds,
            cert_cache_capacity,
            max_request_body_size,
            max_header_size,
            connect_timeout_seconds,
            idle_timeout_seconds,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(_), None) => return Err(anyhow::anyhow!("MITM_CA_CERT_PATH is set without MITM_CA_KEY_PATH")),
            (None, Some(_)) => return Err(anyhow::anyhow!("MITM_CA_KEY_PATH is set without MITM_CA_CERT_PATH")),
            _ => {}
        }
        if self.cert_cache_sweep_seconds == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_SWEEP_SECONDS must be greater than 0"));
        }
        if self.cert_cache_capacity == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_CAPACITY must be greater than 0"));
        }
        if self.max_header_size == 0 {
            return Err(anyhow::anyhow!("MAX_HEADER_SIZE must be greater than 0"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Custom CA from disk when configured, the bundled CA otherwise
    pub fn load_ca(&self) -> Result<CertificateAuthority> {
        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => CertificateAuthority::from_files(cert, key)
                .with_context(|| format!("Failed to load CA from {} and {}", cert, key)),
            _ => CertificateAuthority::bundled().context("Failed to load bundled CA"),
        }
    }

    /// Certificate cache for the configured backend (spawns the TTL sweeper)
    pub fn cert_store(&self) -> Arc<dyn CertStorage> {
        let ttl = Duration::from_secs(self.cert_cache_ttl_seconds);
        match self.cert_cache_backend {
            CertCacheBackend::Expiring => ExpiringCertStore::with_sweeper(
                ttl,
                Duration::from_secs(self.cert_cache_sweep_seconds),
            ),
            CertCacheBackend::Lru => {
                let ttl = (self.cert_cache_ttl_seconds > 0).then_some(ttl);
                Arc::new(LruCertStore::new(self.cert_cache_capacity, ttl))
            }
            CertCacheBackend::None => Arc::new(NoCertCache),
        }
    }

    pub fn options(&self) -> ProxyOptions {
        ProxyOptions {
            keep_accept_encoding: self.keep_accept_encoding,
            limits: Limits {
                max_header_size: self.max_header_size,
                max_body_size: self.max_request_body_size,
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            idle_timeout: (self.idle_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.idle_timeout_seconds)),
        }
    }

    /// Builder carrying this configuration; handlers can still be added
    pub fn proxy_builder(&self) -> Result<ProxyBuilder> {
        let ca = Arc::new(self.load_ca()?);
        let builder = ProxyBuilder::new()
            .ca(ca)
            .cert_store(self.cert_store())
            .options(self.options());

        Ok(if self.mitm_all {
            builder.on_request([]).handle_connect(AlwaysMitm)
        } else {
            builder
        })
    }
}
