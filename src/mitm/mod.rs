//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides the TLS side of interception:
//! - Certificate Authority loading, generation and persistence
//! - Deterministic leaf certificate signing for intercepted hosts
//! - Certificate caching with TTL sweeping, LRU or no caching at all
//! - TLS configuration for the client-facing and upstream legs
//! - The request loop run inside an intercepted tunnel

pub mod ca;
pub mod cert_store;
pub mod csprng;
pub mod error;
pub(crate) mod interceptor;
pub mod signer;
pub mod tls_config;

// Re-export main types
pub use ca::{CaConfig, CertificateAuthority, KeyKind, DEFAULT_CA_CERT_PEM, DEFAULT_CA_KEY_PEM};
pub use cert_store::{
    CertStorage, ExpiringCertStore, Generator, LruCertStore, NoCertCache,
};
pub use csprng::CounterRng;
pub use error::MitmError;
pub use signer::{
    sign_host, strip_port, HostIdentifier, LeafCertificate, SigningRequest, SIGNER_VERSION,
};
pub use tls_config::{
    parse_server_name, CaTlsConfig, ClientTlsConfig, TlsConfigSource, UpstreamTlsConfig,
};
