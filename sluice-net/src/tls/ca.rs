use std::fs;
use std::path::Path;

use chrono::Utc;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509, X509NameBuilder};

use super::cert::asn1_time;
use super::types::{CaCertificate, TlsError, TlsErrorKind};

const CA_VALIDITY_DAYS: i64 = 3650;
pub(crate) const CA_CERT_FILE: &str = "sluice-ca.pem";
pub(crate) const CA_KEY_FILE: &str = "sluice-ca-key.pem";

/// Parse a PEM CA certificate and its RSA private key.
///
/// The key may be PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).
pub fn load_ca(cert_pem: &[u8], key_pem: &[u8]) -> Result<CaCertificate, TlsError> {
    let cert = X509::from_pem(cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::InvalidCa, format!("ca certificate: {err}")))?;
    let key = parse_rsa_key(key_pem)?;

    let public = cert.public_key()?;
    if !public.public_eq(&key) {
        return Err(TlsError::new(
            TlsErrorKind::InvalidCa,
            "ca private key does not match certificate",
        ));
    }

    Ok(CaCertificate {
        cert_der: cert.to_der()?,
        cert_pem: cert_pem.to_vec(),
        cert,
        key,
        cert_path: None,
    })
}

fn parse_rsa_key(key_pem: &[u8]) -> Result<PKey<Private>, TlsError> {
    let pkcs1 = twoway::find_bytes(key_pem, b"BEGIN RSA PRIVATE KEY").is_some();
    let key = if pkcs1 {
        Rsa::private_key_from_pem(key_pem).and_then(PKey::from_rsa)
    } else {
        PKey::private_key_from_pem(key_pem)
    }
    .map_err(|err| TlsError::new(TlsErrorKind::InvalidCa, format!("ca private key: {err}")))?;

    if key.id() != Id::RSA {
        return Err(TlsError::new(
            TlsErrorKind::NotRsa,
            format!("ca private key type {} is not RSA", key.id().as_raw()),
        ));
    }
    Ok(key)
}

/// Mint a fresh self-signed RSA CA.
pub fn generate_ca(common_name: &str) -> Result<CaCertificate, TlsError> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    name.append_entry_by_text("O", "Sluice")?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let now = Utc::now();
    let not_before = asn1_time(now - chrono::Duration::hours(1))?;
    let not_after = asn1_time(now + chrono::Duration::days(CA_VALIDITY_DAYS))?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let subject_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok(CaCertificate {
        cert_pem: cert.to_pem()?,
        cert_der: cert.to_der()?,
        cert,
        key,
        cert_path: None,
    })
}

/// Load the CA from `dir`, minting and saving one on first run.
pub(crate) fn load_or_generate_ca(
    dir: impl AsRef<Path>,
    common_name: &str,
) -> Result<CaCertificate, TlsError> {
    let dir = dir.as_ref();
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    let mut ca = if cert_path.exists() && key_path.exists() {
        load_ca(&fs::read(&cert_path)?, &fs::read(&key_path)?)?
    } else {
        let ca = generate_ca(common_name)?;
        fs::create_dir_all(dir)?;
        fs::write(&cert_path, &ca.cert_pem)?;
        fs::write(&key_path, ca.key.private_key_to_pem_pkcs8()?)?;
        tracing::info!(path = %cert_path.display(), "generated new CA certificate");
        ca
    };
    ca.cert_path = Some(cert_path);
    Ok(ca)
}
