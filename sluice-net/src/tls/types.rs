use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CaCertificate {
    pub cert: X509,
    pub key: PKey<Private>,
    pub cert_pem: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub host: String,
    pub cert: X509,
    pub key: PKey<Private>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl LeafCertificate {
    /// A cached leaf is only handed out while it has at least `margin` left.
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => self.not_after - margin > now,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateOptions {
    pub leaf_validity: Duration,
    pub renew_before: Duration,
    pub backdate: Duration,
}

impl Default for CertificateOptions {
    fn default() -> Self {
        Self {
            leaf_validity: Duration::from_secs(365 * 24 * 3600),
            renew_before: Duration::from_secs(24 * 3600),
            backdate: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Io,
    OpenSsl,
    InvalidCa,
    NotRsa,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<openssl::error::ErrorStack> for TlsError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::new(TlsErrorKind::OpenSsl, err.to_string())
    }
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        Self::new(TlsErrorKind::Io, err.to_string())
    }
}
