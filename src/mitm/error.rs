//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate or key could not be loaded
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// CA key algorithm cannot key the signing keystream
    #[error("Unsupported CA key type: {0}")]
    UnsupportedKey(String),

    /// Signing request without hosts
    #[error("Cannot sign a certificate for an empty host list")]
    NoHosts,

    /// Host cannot be placed in a certificate
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {hosts}: {reason}")]
    CertGenerationFailed { hosts: String, reason: String },

    /// Keystream could not be produced
    #[error("Keystream failure: {0}")]
    Entropy(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(hosts: impl Into<String>, msg: impl ToString) -> Self {
        Self::CertGenerationFailed {
            hosts: hosts.into(),
            reason: msg.to_string(),
        }
    }

    /// Create a TLS configuration error
    pub fn tls_config(msg: impl ToString) -> Self {
        Self::TlsConfigFailed(msg.to_string())
    }
}
