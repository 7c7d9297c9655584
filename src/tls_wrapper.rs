use std::io;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Client-side TLS configuration backed by the native certificate store.
#[derive(Clone)]
pub struct TlsWrapper {
    config: Arc<ClientConfig>,
}

impl TlsWrapper {
    pub fn with_native_roots() -> io::Result<Self> {
        let mut root_store = RootCertStore::empty();
        let mut rejected = 0usize;
        for cert in rustls_native_certs::load_native_certs()? {
            if root_store.add(&rustls::Certificate(cert.0)).is_err() {
                rejected += 1;
            }
        }
        debug!(roots = root_store.len(), rejected, "loaded native trust roots");

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub fn server_name(name: &str) -> io::Result<ServerName> {
        ServerName::try_from(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{name}: {e}")))
    }
}
