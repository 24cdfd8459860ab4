use std::sync::Arc;

use openssl::ssl::{
    NameType, SniError, SslAcceptor, SslConnector, SslContext, SslContextBuilder, SslMethod,
    SslVerifyMode, SslVersion,
};

use super::manager::CertificateManager;
use super::types::{CaCertificate, LeafCertificate, TlsError};

const SERVER_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305";

/// Server-side acceptor for a bridged CONNECT tunnel.
///
/// `default_host` (the CONNECT target) is presented unless the ClientHello
/// names a different server, in which case a certificate for that name is
/// swapped in from the manager.
pub fn build_acceptor(
    manager: &Arc<CertificateManager>,
    default_host: Option<&str>,
) -> Result<SslAcceptor, TlsError> {
    let leaf = manager.certificate_for_server_name(default_host)?;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_cipher_list(SERVER_CIPHERS)?;
    builder.set_verify(SslVerifyMode::NONE);
    apply_leaf(&mut builder, &leaf, manager.ca())?;

    let sni_manager = Arc::clone(manager);
    let default_host = leaf.host.clone();
    builder.set_servername_callback(move |ssl, _alert| {
        let Some(name) = ssl.servername(NameType::HOST_NAME).map(str::to_owned) else {
            return Ok(());
        };
        if name.eq_ignore_ascii_case(&default_host) {
            return Ok(());
        }
        let context = sni_manager
            .certificate_for_server_name(Some(&name))
            .and_then(|leaf| leaf_context(&leaf, sni_manager.ca()));
        match context {
            Ok(context) => ssl
                .set_ssl_context(&context)
                .map_err(|_| SniError::ALERT_FATAL),
            Err(err) => {
                tracing::warn!(server_name = %name, error = %err, "no certificate for SNI");
                Err(SniError::ALERT_FATAL)
            }
        }
    });

    Ok(builder.build())
}

/// Upstream connector. Upstream certificates are deliberately not verified.
pub fn build_connector() -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

fn leaf_context(leaf: &LeafCertificate, ca: &CaCertificate) -> Result<SslContext, TlsError> {
    let mut builder = SslContext::builder(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    apply_leaf(&mut builder, leaf, ca)?;
    Ok(builder.build())
}

fn apply_leaf(
    builder: &mut SslContextBuilder,
    leaf: &LeafCertificate,
    ca: &CaCertificate,
) -> Result<(), TlsError> {
    builder.set_certificate(&leaf.cert)?;
    builder.set_private_key(&leaf.key)?;
    builder.add_extra_chain_cert(ca.cert.clone())?;
    builder.check_private_key()?;
    Ok(())
}
