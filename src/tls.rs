//! Certificate loading for `listen_schema https`

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Parse a PEM certificate chain and private key.
pub fn server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerConfig> {
    let mut cert_reader = BufReader::new(cert_pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::tls(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("No certificate found in PEM"));
    }

    let mut key_reader = BufReader::new(key_pem.as_bytes());
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::tls("No private key found in PEM"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Load the listener certificate and key from PEM files.
pub fn load_server_config(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<ServerConfig> {
    let read = |path: &Path, what: &str| {
        std::fs::read_to_string(path).map_err(|e| {
            Error::tls(format!("Failed to read {} '{}': {}", what, path.display(), e))
        })
    };
    let cert_pem = read(cert_path.as_ref(), "certificate")?;
    let key_pem = read(key_path.as_ref(), "private key")?;
    server_config_from_pem(&cert_pem, &key_pem)
}

pub fn acceptor(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<TlsAcceptor> {
    let config = load_server_config(cert_path, key_path)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
