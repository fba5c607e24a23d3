//! TLS material loading and rustls configuration.
//!
//! Every config is built with an explicit aws-lc-rs provider so the crate
//! never depends on a process-wide default.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFiles;
use crate::error::{PerfError, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        return Err(PerfError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)?
        .ok_or_else(|| PerfError::Config(format!("no private key found in {}", path.display())))
}

/// Server config presenting `files` and offering `alpn` in preference order.
pub fn server_config(files: &TlsFiles, alpn: Vec<Vec<u8>>) -> Result<ServerConfig> {
    let certs = load_certs(&files.cert)?;
    let key = load_private_key(&files.key)?;
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn;
    Ok(config)
}

/// Acceptor for [`server_config`].
pub fn acceptor(files: &TlsFiles, alpn: Vec<Vec<u8>>) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(files, alpn)?)))
}

/// Client config trusting `ca` if given, the public web roots otherwise.
pub fn client_config(ca: Option<&Path>, alpn: Vec<Vec<u8>>) -> Result<ClientConfig> {
    let root_store = match ca {
        Some(path) => {
            let mut store = RootCertStore::empty();
            for cert in load_certs(path)? {
                store.add(cert)?;
            }
            store
        }
        None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    };
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = alpn;
    Ok(config)
}
