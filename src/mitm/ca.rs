//! Certificate Authority (CA) Management
//!
//! The CA is loaded once at startup and is read-only afterwards. It can come
//! from:
//! - the bundled default pair shipped with the crate
//! - PEM strings or files supplied by the embedding application
//! - a freshly generated ECDSA P-256 root, optionally persisted to disk
//!
//! Clients only trust intercepted connections after installing the CA
//! certificate ([`CertificateAuthority::cert_pem`]) into their trust store.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SignatureAlgorithm,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::error::{MitmError, Result};

/// Bundled root certificate (ECDSA P-256)
pub const DEFAULT_CA_CERT_PEM: &str = include_str!("../../certs/ca.pem");

/// Private key of the bundled root (PKCS#8)
pub const DEFAULT_CA_KEY_PEM: &str = include_str!("../../certs/ca.key.pem");

/// Key families that can sign leaves and key the signing keystream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ecdsa,
}

impl KeyKind {
    /// Classify a key algorithm, `None` when unsupported
    pub fn of(alg: &SignatureAlgorithm) -> Option<Self> {
        let ecdsa = [&rcgen::PKCS_ECDSA_P256_SHA256, &rcgen::PKCS_ECDSA_P384_SHA384];
        let rsa = [
            &rcgen::PKCS_RSA_SHA256,
            &rcgen::PKCS_RSA_SHA384,
            &rcgen::PKCS_RSA_SHA512,
        ];

        if ecdsa.iter().any(|candidate| *candidate == alg) {
            Some(Self::Ecdsa)
        } else if rsa.iter().any(|candidate| *candidate == alg) {
            Some(Self::Rsa)
        } else {
            None
        }
    }
}

/// Settings for generating a new CA
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Where the CA certificate is read from / written to
    pub cert_path: Option<String>,

    /// Where the CA private key is read from / written to
    pub key_path: Option<String>,

    /// Validity of a generated root in days
    pub validity_days: u32,

    /// Organization name of a generated root
    pub organization: String,

    /// Common name of a generated root
    pub common_name: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            validity_days: 3650,
            organization: "Interpose".to_string(),
            common_name: "Interpose Proxy CA".to_string(),
        }
    }
}

/// Root certificate and signing key for forged leaves
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    key_der: Vec<u8>,
    key_kind: KeyKind,
}

impl CertificateAuthority {
    /// Load the CA bundled with the crate
    pub fn bundled() -> Result<Self> {
        Self::from_pem(DEFAULT_CA_CERT_PEM, DEFAULT_CA_KEY_PEM)
    }

    /// Load a CA from PEM-encoded certificate and private key (RSA or EC)
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;
        let key_kind = KeyKind::of(key.algorithm())
            .ok_or_else(|| MitmError::UnsupportedKey(format!("{:?}", key.algorithm())))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| MitmError::ca_load("No certificate found in PEM"))?
            .map_err(|e| MitmError::ca_load(format!("Failed to read certificate PEM: {}", e)))?;

        let key_der = key.serialize_der();
        let key_pem = key.serialize_pem();
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
            key_pem,
            key_der,
            key_kind,
        })
    }

    /// Load a CA from PEM files on disk
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert = %cert_path.display(), key = %key_path.display(), "Loading CA from disk");

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generate a new self-signed ECDSA P-256 root
    pub fn generate(config: &CaConfig) -> Result<Self> {
        info!(common_name = %config.common_name, "Generating CA certificate and private key");

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.use_authority_key_identifier_extension = true;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, config.organization.clone());
        distinguished_name.push(DnType::CommonName, config.common_name.clone());
        params.distinguished_name = distinguished_name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(i64::from(config.validity_days));

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let cert = params.self_signed(&key).map_err(|e| {
            MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e))
        })?;

        let key_der = key.serialize_der();
        let key_pem = key.serialize_pem();
        let key_kind = KeyKind::of(key.algorithm())
            .ok_or_else(|| MitmError::UnsupportedKey(format!("{:?}", key.algorithm())))?;

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            issuer: Issuer::new(params, key),
            key_pem,
            key_der,
            key_kind,
        })
    }

    /// Load the CA from the configured paths, generating and saving one when
    /// neither file exists yet. Without paths a throwaway CA is generated.
    pub fn load_or_generate(config: &CaConfig) -> Result<Self> {
        match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_exists = Path::new(cert_path).exists();
                let key_exists = Path::new(key_path).exists();
                match (cert_exists, key_exists) {
                    (true, true) => Self::from_files(cert_path, key_path),
                    (false, false) => {
                        let ca = Self::generate(config)?;
                        ca.save(cert_path, key_path)?;
                        Ok(ca)
                    }
                    _ => Err(MitmError::ca_load(
                        "CA cert and key files must both exist or both be absent",
                    )),
                }
            }
            (None, None) => Self::generate(config),
            _ => Err(MitmError::ca_load(
                "CA cert path and key path must be set together",
            )),
        }
    }

    /// Persist certificate and private key as PEM
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        info!(cert = %cert_path.display(), key = %key_path.display(), "Saving CA to disk");

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        fs::write(cert_path, &self.cert_pem)
            .map_err(|e| MitmError::ca_generation(format!("Failed to save certificate: {}", e)))?;
        fs::write(key_path, &self.key_pem)
            .map_err(|e| MitmError::ca_generation(format!("Failed to save private key: {}", e)))?;
        Ok(())
    }

    /// Issuer used to sign leaves
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// DER of the root certificate, appended to every leaf chain
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM of the root certificate, for installing into trust stores
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key DER, keys the signing keystream
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("key_kind", &self.key_kind)
            .finish_non_exhaustive()
    }
}
