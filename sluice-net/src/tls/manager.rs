use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::ca::load_or_generate_ca;
use super::cert::mint_leaf;
use super::types::{CaCertificate, CertificateOptions, LeafCertificate, TlsError};

const FALLBACK_SERVER_NAME: &str = "localhost";

/// Mints per-host leaf certificates signed by the proxy CA and caches them.
///
/// Cache hits only take the read lock. A miss takes a per-host gate so that
/// concurrent handshakes for the same new host produce one certificate.
#[derive(Debug)]
pub struct CertificateManager {
    ca: CaCertificate,
    options: CertificateOptions,
    cache: RwLock<HashMap<String, Arc<LeafCertificate>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateManager {
    pub fn new(ca: CaCertificate, options: CertificateOptions) -> Self {
        Self {
            ca,
            options,
            cache: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_or_generate(
        dir: impl AsRef<Path>,
        common_name: &str,
        options: CertificateOptions,
    ) -> Result<Self, TlsError> {
        Ok(Self::new(load_or_generate_ca(dir, common_name)?, options))
    }

    pub fn ca(&self) -> &CaCertificate {
        &self.ca
    }

    pub fn options(&self) -> &CertificateOptions {
        &self.options
    }

    pub fn generate_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>, TlsError> {
        let host = normalize_host(host);
        if let Some(leaf) = self.cached(&host) {
            return Ok(leaf);
        }

        let gate = {
            let mut gates = self.gates.lock();
            Arc::clone(gates.entry(host.clone()).or_default())
        };
        let leaf = {
            let _guard = gate.lock();
            // Whoever held the gate before us may already have filled the cache.
            match self.cached(&host) {
                Some(leaf) => Ok(leaf),
                None => self.mint(&host),
            }
        };
        self.gates.lock().remove(&host);
        leaf
    }

    fn mint(&self, host: &str) -> Result<Arc<LeafCertificate>, TlsError> {
        let leaf = Arc::new(mint_leaf(host, &self.ca, &self.options, Utc::now())?);
        self.cache.write().insert(host.to_string(), Arc::clone(&leaf));
        tracing::debug!(host = %host, not_after = %leaf.not_after, "minted leaf certificate");
        Ok(leaf)
    }

    /// Certificate for a TLS ClientHello server name; clients that send no
    /// SNI get a `localhost` certificate.
    pub fn certificate_for_server_name(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<LeafCertificate>, TlsError> {
        let name = server_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(FALLBACK_SERVER_NAME);
        self.generate_certificate(name)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.read().len()
    }

    pub fn export_certificate(&self, host: &str, path: impl AsRef<Path>) -> Result<(), TlsError> {
        let leaf = self.generate_certificate(host)?;
        fs::write(path, &leaf.cert_pem)?;
        Ok(())
    }

    pub fn ca_certificate_path(&self) -> Option<&Path> {
        self.ca.cert_path.as_deref()
    }

    fn cached(&self, host: &str) -> Option<Arc<LeafCertificate>> {
        let cache = self.cache.read();
        cache
            .get(host)
            .filter(|leaf| leaf.is_fresh(self.options.renew_before, Utc::now()))
            .cloned()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
