//! TLS acceptor setup for the secure protocol.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::server::config::ServerConfig;
use crate::server::error::ConfigurationError;

/// Self-signed `localhost` pair used when no certificate is configured.
const DEV_CERTIFICATE: &[u8] = include_bytes!("../../certs/dev_cert.pem");
const DEV_PRIVATE_KEY: &[u8] = include_bytes!("../../certs/dev_key.pem");

/// Protocols offered through ALPN, most preferred first.
pub fn alpn_protocols(http2: bool) -> Vec<Vec<u8>> {
    if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

/// Build the acceptor from the configured certificate and key, or from the
/// bundled development pair when none is configured.
pub async fn make_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, ConfigurationError> {
    let (certificate, private_key) = match (&config.certificate, &config.private_key) {
        (Some(certificate), Some(private_key)) => (read_pem(certificate).await?, read_pem(private_key).await?),
        (None, None) => (DEV_CERTIFICATE.to_vec(), DEV_PRIVATE_KEY.to_vec()),
        _ => return Err(ConfigurationError::IncompleteCertificate),
    };
    let tls = make_rustls_config(&certificate, &private_key, alpn_protocols(config.http2))?;
    Ok(TlsAcceptor::from(Arc::new(tls)))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigurationError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ConfigurationError::InvalidCertificate(format!("{}: {e}", path.display())))
}

/// A rustls server configuration from PEM encoded chain and key.
pub fn make_rustls_config(
    certificate: &[u8],
    private_key: &[u8],
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<rustls::ServerConfig, ConfigurationError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(certificate))
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigurationError::InvalidCertificate(format!("bad certificate: {e}")))?;
    if chain.is_empty() {
        return Err(ConfigurationError::InvalidCertificate("no certificate found".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut Cursor::new(private_key))
        .map_err(|e| ConfigurationError::InvalidCertificate(format!("bad private key: {e}")))?
        .ok_or_else(|| ConfigurationError::InvalidCertificate("no private key found".to_string()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigurationError::Invalid(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ConfigurationError::InvalidCertificate(e.to_string()))?;
    tls.alpn_protocols = alpn_protocols;
    Ok(tls)
}
