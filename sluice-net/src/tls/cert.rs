use std::net::IpAddr;

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509NameBuilder};

use super::types::{CaCertificate, CertificateOptions, LeafCertificate, TlsError, TlsErrorKind};

pub(crate) fn mint_leaf(
    host: &str,
    ca: &CaCertificate,
    options: &CertificateOptions,
    now: DateTime<Utc>,
) -> Result<LeafCertificate, TlsError> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    // CN is capped at 64 bytes; longer names rely on the SAN alone.
    let mut name = X509NameBuilder::new()?;
    if host.len() <= 64 {
        name.append_entry_by_text("CN", host)?;
    }
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let not_before = now - to_chrono(options.backdate)?;
    let not_after = not_before + to_chrono(options.leaf_validity)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(ca.cert.subject_name())?;
    builder.set_pubkey(&key)?;
    let valid_from = asn1_time(not_before)?;
    let valid_until = asn1_time(not_after)?;
    builder.set_not_before(&valid_from)?;
    builder.set_not_after(&valid_until)?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;

    let mut san = SubjectAlternativeName::new();
    if host.parse::<IpAddr>().is_ok() {
        san.ip(host);
    } else {
        san.dns(host);
        if !host.starts_with("www.") {
            san.dns(&format!("www.{host}"));
        }
    }
    let san = san.build(&builder.x509v3_context(Some(&ca.cert), None))?;
    builder.append_extension(san)?;

    builder.sign(&ca.key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok(LeafCertificate {
        host: host.to_string(),
        cert_pem: cert.to_pem()?,
        key_pem: key.private_key_to_pem_pkcs8()?,
        cert,
        key,
        not_before,
        not_after,
    })
}

fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration, TlsError> {
    chrono::Duration::from_std(duration)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, format!("validity window: {err}")))
}

pub(crate) fn asn1_time(at: DateTime<Utc>) -> Result<Asn1Time, TlsError> {
    let seconds = at
        .timestamp()
        .try_into()
        .map_err(|_| TlsError::new(TlsErrorKind::OpenSsl, "timestamp out of range"))?;
    Ok(Asn1Time::from_unix(seconds)?)
}
