//! TLS acceptor for [`crate::FakeServer::serve`].

use crate::config::TlsConfig;
use crate::error::FakeDbError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{danger::ClientCertVerifier, WebPkiClientVerifier};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds an acceptor from the configured certificate and key, verifying
/// client certificates when `require_client_cert` is set.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, FakeDbError> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| FakeDbError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| FakeDbError::TlsConfig("key_path not set".into()))?;
    let client_ca = match (config.require_client_cert, config.client_ca_path.as_deref()) {
        (true, None) => {
            return Err(FakeDbError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let builder = match client_ca {
        Some(path) => builder.with_client_cert_verifier(client_verifier(path)?),
        None => builder.with_no_client_auth(),
    };
    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| FakeDbError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn client_verifier(ca_path: &Path) -> Result<Arc<dyn ClientCertVerifier>, FakeDbError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| FakeDbError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
    }
    WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| FakeDbError::TlsConfig(format!("failed to build client verifier: {}", e)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, FakeDbError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| FakeDbError::TlsConfig(format!("cannot open {} {:?}: {}", what, path, e)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, FakeDbError> {
    let mut reader = open(path, "cert file")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FakeDbError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(FakeDbError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, FakeDbError> {
    let mut reader = open(path, "key file")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| FakeDbError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| FakeDbError::TlsConfig(format!("no private key found in {:?}", path)))
}
