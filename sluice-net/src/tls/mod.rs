mod ca;
mod cert;
mod manager;
mod openssl;
mod types;

pub use ca::{generate_ca, load_ca};
pub use manager::CertificateManager;
pub use openssl::{build_acceptor, build_connector};
pub use types::{CaCertificate, CertificateOptions, LeafCertificate, TlsError, TlsErrorKind};
