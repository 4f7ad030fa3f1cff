//! TLS termination.
//!
//! Certificates come from PEM files named by the endpoint descriptor. ALPN
//! offers `h2` then `http/1.1`; WebSockets ride the latter via the upgrade
//! dance, they cannot be negotiated here.
use std::io::{self, BufReader};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::endpoint::TlsSettings;

pub(crate) fn build_acceptor(settings: &TlsSettings) -> io::Result<TlsAcceptor> {
    let mut reader = BufReader::new(std::fs::File::open(&settings.certificate)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(invalid("no certificates found in certificate file"));
    }

    let mut reader = BufReader::new(std::fs::File::open(&settings.private_key)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| invalid("no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| invalid(format!("invalid certificate or key: {err}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn invalid(message: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
