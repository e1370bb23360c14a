//! TLS termination.
//!
//! PEM files only: a certificate chain (leaf first) and one private key in
//! PKCS#8, PKCS#1 (RSA) or SEC1 (EC) form.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pemfile::Item;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::error::Error;

pub(crate) fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, Error> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_key(key)?)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        if let Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) = item {
            return Ok(PrivateKey(key));
        }
    }
    Err(Error::Tls(format!("no private key in {}", path.display())))
}
