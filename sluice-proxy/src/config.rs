use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_net::CertificateOptions;
use sluice_store::DEFAULT_CHUNK_SIZE;

use crate::error::ProxyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    /// Extra host names that address the proxy itself on any port.
    pub advertised_host: Vec<String>,
    pub tls: TlsConfig,
    pub upstream: UpstreamConfig,
    pub intercept: InterceptConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_common_name: String,
    pub ca_cert_dir: String,
    pub leaf_validity_days: u32,
    pub renew_before_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterceptConfig {
    pub enabled_on_start: bool,
    /// Requests arriving while this many are held get `503 Service Unavailable`.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub chunk_size_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            advertised_host: vec!["sluice".to_string()],
            tls: TlsConfig::default(),
            upstream: UpstreamConfig::default(),
            intercept: InterceptConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_common_name: "Sluice Proxy CA".to_string(),
            ca_cert_dir: "certs".to_string(),
            leaf_validity_days: 365,
            renew_before_hours: 24,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            response_timeout_secs: 60,
        }
    }
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            enabled_on_start: false,
            queue_capacity: 1024,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ProxyConfig {
    pub fn load_or_create(path: &Path) -> Result<Self, ProxyError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|err| ProxyError::Config(err.to_string()))
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ProxyError> {
        let contents =
            toml::to_string_pretty(self).map_err(|err| ProxyError::Config(err.to_string()))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        if self.listen.host.contains(':') {
            format!("[{}]:{}", self.listen.host, self.listen.port)
        } else {
            format!("{}:{}", self.listen.host, self.listen.port)
        }
    }

    pub fn ca_dir(&self) -> PathBuf {
        PathBuf::from(&self.tls.ca_cert_dir)
    }

    pub fn certificate_options(&self) -> CertificateOptions {
        CertificateOptions {
            leaf_validity: Duration::from_secs(u64::from(self.tls.leaf_validity_days) * 24 * 3600),
            renew_before: Duration::from_secs(u64::from(self.tls.renew_before_hours) * 3600),
            ..CertificateOptions::default()
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.history.chunk_size_bytes == 0 {
            return Err(ProxyError::Config(
                "history.chunk_size_bytes must be positive".to_string(),
            ));
        }
        if self.intercept.queue_capacity == 0 {
            return Err(ProxyError::Config(
                "intercept.queue_capacity must be positive".to_string(),
            ));
        }
        if self.tls.leaf_validity_days == 0 {
            return Err(ProxyError::Config(
                "tls.leaf_validity_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}
