//! TLS factories
//!
//! The relay authenticates with a (typically self-signed) certificate;
//! clients pin that certificate as their only trust anchor. TLS 1.2 only,
//! no client authentication.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::error::ChatError;

/// Build the relay's TLS acceptor from PEM-encoded certificate chain and key
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ChatError> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_key(key_pem)?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load the relay's certificate and key files
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ChatError> {
    info!("Loading TLS certificate from {}", cert_path.display());
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;
    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Build a client connector that trusts only the given certificate(s)
pub fn connector_from_pem(pinned_pem: &[u8]) -> Result<TlsConnector, ChatError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pinned_pem)? {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load the pinned relay certificate
pub fn load_connector(pinned_path: &Path) -> Result<TlsConnector, ChatError> {
    let pem = std::fs::read(pinned_path)?;
    connector_from_pem(&pem)
}

/// Name the relay's certificate must be valid for (DNS name or IP)
pub fn server_name(host: &str) -> Result<ServerName<'static>, ChatError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ChatError::Config(format!("'{}' is not a valid TLS server name", host)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ChatError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ChatError::Config("no certificate found in PEM data".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ChatError> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| ChatError::Config("no private key found in PEM data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pem_rejected() {
        assert!(matches!(
            connector_from_pem(b""),
            Err(ChatError::Config(_))
        ));
        assert!(matches!(
            acceptor_from_pem(b"", b""),
            Err(ChatError::Config(_))
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("relay.example").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name("not a host!").is_err());
    }
}
