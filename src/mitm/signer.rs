//! Leaf certificate signing
//!
//! `sign_host` forges an end-entity certificate for a [`SigningRequest`] under
//! the proxy CA. The leaf key pair is drawn from a [`CounterRng`] seeded with
//! the canonical host list plus [`SIGNER_VERSION`], so a given CA and host set
//! always yields the same leaf key. Serial numbers and validity timestamps
//! still vary between calls.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use p256::pkcs8::EncodePrivateKey;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::ca::CertificateAuthority;
use super::csprng::CounterRng;
use super::error::{MitmError, Result};
use super::tls_config::ClientTlsConfig;

/// Mixed into every keystream seed so a new release never reuses old leaf keys
pub const SIGNER_VERSION: &str = concat!("interpose/", env!("CARGO_PKG_VERSION"));

/// Leaf validity in days (ten years)
const LEAF_VALIDITY_DAYS: i64 = 3650;

/// How a host is placed in the subject alternative names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostIdentifier {
    /// DNS name (e.g., example.com)
    Domain(String),

    /// IP literal (e.g., 1.1.1.1 or ::1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Classify a host with its port already stripped
    pub fn from_hostname(hostname: &str) -> Self {
        let bare = hostname.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::IpAddress(ip),
            Err(_) => Self::Domain(hostname.to_ascii_lowercase()),
        }
    }

    fn to_san(&self) -> Result<SanType> {
        match self {
            Self::IpAddress(ip) => Ok(SanType::IpAddress(*ip)),
            Self::Domain(name) => name
                .as_str()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e| MitmError::InvalidHost(format!("{}: {}", name, e))),
        }
    }
}

impl std::fmt::Display for HostIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(name) => f.write_str(name),
            Self::IpAddress(ip) => write!(f, "{}", ip),
        }
    }
}

/// Remove a trailing `:port` from `host:port`, `[v6]:port` or `[v6]`
///
/// Bare IPv6 literals (more than one colon, no brackets) are returned as-is.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }

    match host.rfind(':') {
        Some(idx) if host[..idx].find(':').is_none() => &host[..idx],
        _ => host,
    }
}

/// Hosts one leaf certificate must be valid for
///
/// Order is preserved (the first host becomes the subject common name) while
/// [`cache_key`](Self::cache_key) is order-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    hosts: Vec<HostIdentifier>,
}

impl SigningRequest {
    /// Normalize hosts: ports stripped, names lowercased, duplicates dropped
    pub fn new<I, S>(hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<HostIdentifier> = Vec::new();
        for host in hosts {
            let host = strip_port(host.as_ref().trim());
            if host.is_empty() {
                continue;
            }
            let id = HostIdentifier::from_hostname(host);
            if !normalized.contains(&id) {
                normalized.push(id);
            }
        }

        if normalized.is_empty() {
            return Err(MitmError::NoHosts);
        }
        Ok(Self { hosts: normalized })
    }

    pub fn hosts(&self) -> &[HostIdentifier] {
        &self.hosts
    }

    /// Sorted, comma-joined host list
    pub fn cache_key(&self) -> String {
        let mut names: Vec<String> = self.hosts.iter().map(ToString::to_string).collect();
        names.sort();
        names.join(",")
    }

    /// Keystream seed for this host set
    pub fn seed(&self) -> String {
        format!("{}:{}", self.cache_key(), SIGNER_VERSION)
    }
}

/// Signed leaf chain plus its private key
pub struct LeafCertificate {
    hosts: Vec<HostIdentifier>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivatePkcs8KeyDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    pub fn hosts(&self) -> &[HostIdentifier] {
        &self.hosts
    }

    /// `[leaf, ca]`
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }

    /// Client-facing TLS config presenting this leaf
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

/// Forge a leaf certificate for `request`, signed by `ca`
///
/// Either a complete, verifiable chain is returned or an error; nothing is
/// cached here (see [`CertStorage`](super::cert_store::CertStorage)).
pub fn sign_host(ca: &CertificateAuthority, request: &SigningRequest) -> Result<LeafCertificate> {
    let label = request.cache_key();
    let mut rng = CounterRng::new(ca.key_der(), request.seed().as_bytes())?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| MitmError::cert_generation(&label, e))?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(generate_serial_number());

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, request.hosts()[0].to_string());
    params.distinguished_name = distinguished_name;

    for host in request.hosts() {
        params.subject_alt_names.push(host.to_san()?);
    }

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let (leaf_key, key_der) = derive_leaf_key(&mut rng, &label)?;
    let cert = params
        .signed_by(&leaf_key, ca.issuer())
        .map_err(|e| MitmError::cert_generation(&label, e))?;

    let chain = vec![cert.der().clone(), ca.cert_der().clone()];
    let server_config =
        ClientTlsConfig::new(chain.clone(), PrivateKeyDer::Pkcs8(key_der.clone_key()))?
            .server_config();

    debug!(hosts = %label, "Signed leaf certificate");

    Ok(LeafCertificate {
        hosts: request.hosts().to_vec(),
        chain,
        key: key_der,
        server_config,
    })
}

/// ECDSA P-256 key pair drawn from the keystream
fn derive_leaf_key(
    rng: &mut CounterRng,
    label: &str,
) -> Result<(KeyPair, PrivatePkcs8KeyDer<'static>)> {
    let secret = p256::SecretKey::random(rng);
    let document = secret
        .to_pkcs8_der()
        .map_err(|e| MitmError::cert_generation(label, e))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(document.as_bytes().to_vec());

    let key = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| MitmError::cert_generation(label, e))?;
    Ok((key, pkcs8))
}

/// Timestamp in the high half, random low half
fn generate_serial_number() -> SerialNumber {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let random_part: u32 = rand::random();
    SerialNumber::from((timestamp << 32) | u64::from(random_part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("1.1.1.1:8443"), "1.1.1.1");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_host_identifier_classification() {
        assert_eq!(
            HostIdentifier::from_hostname("1.1.1.1"),
            HostIdentifier::IpAddress("1.1.1.1".parse().unwrap())
        );
        assert_eq!(
            HostIdentifier::from_hostname("::1"),
            HostIdentifier::IpAddress("::1".parse().unwrap())
        );
        assert_eq!(
            HostIdentifier::from_hostname("Example.COM"),
            HostIdentifier::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let ab = SigningRequest::new(["a.example", "b.example"]).unwrap();
        let ba = SigningRequest::new(["b.example", "a.example"]).unwrap();
        assert_eq!(ab.cache_key(), ba.cache_key());
        assert_eq!(ab.cache_key(), "a.example,b.example");

        // common name still follows request order
        assert_eq!(ba.hosts()[0].to_string(), "b.example");
    }

    #[test]
    fn test_signing_request_normalizes() {
        let request = SigningRequest::new(["Example.com:443", "example.com", "", "10.0.0.1:80"])
            .unwrap();
        assert_eq!(request.cache_key(), "10.0.0.1,example.com");
        assert!(request.seed().ends_with(SIGNER_VERSION));
    }

    #[test]
    fn test_empty_request_rejected() {
        assert!(matches!(
            SigningRequest::new(Vec::<String>::new()),
            Err(MitmError::NoHosts)
        ));
        assert!(matches!(SigningRequest::new([":443"]), Err(MitmError::NoHosts)));
    }

    #[test]
    fn test_sign_host_builds_chain() {
        let ca = CertificateAuthority::bundled().unwrap();
        let request = SigningRequest::new(["example.com", "1.1.1.1"]).unwrap();
        let leaf = sign_host(&ca, &request).unwrap();

        assert_eq!(leaf.chain().len(), 2);
        assert_eq!(&leaf.chain()[1], ca.cert_der());
        assert_eq!(leaf.hosts().len(), 2);
        assert_eq!(
            leaf.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_leaf_key_is_reproducible_per_host_set() {
        let ca = CertificateAuthority::bundled().unwrap();
        let first = sign_host(&ca, &SigningRequest::new(["a.test", "b.test"]).unwrap()).unwrap();
        let second = sign_host(&ca, &SigningRequest::new(["b.test", "a.test"]).unwrap()).unwrap();
        let other = sign_host(&ca, &SigningRequest::new(["c.test"]).unwrap()).unwrap();

        assert_eq!(
            first.private_key().secret_der(),
            second.private_key().secret_der()
        );
        assert_ne!(
            first.private_key().secret_der(),
            other.private_key().secret_der()
        );
    }

    #[test]
    fn test_non_ascii_host_rejected() {
        let ca = CertificateAuthority::bundled().unwrap();
        let request = SigningRequest::new(["bücher.example"]).unwrap();
        assert!(matches!(
            sign_host(&ca, &request),
            Err(MitmError::InvalidHost(_))
        ));
    }
}
