//! TLS context: certificates, cipher-suite allow-list and client trust.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName, SupportedCipherSuite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Server and client TLS configuration used by listeners and the connector
#[derive(Clone, Default)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl TlsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    /// Name verified on outbound connects instead of the peer IP
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        self.server
            .clone()
            .map(TlsAcceptor::from)
            .ok_or_else(|| Error::Tls("no server configuration".into()))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        self.client
            .clone()
            .map(TlsConnector::from)
            .ok_or_else(|| Error::Tls("no client configuration".into()))
    }

    pub fn server_name_for(&self, remote: SocketAddr) -> Result<ServerName> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.as_str()).map_err(|e| Error::Tls(e.to_string())),
            None => Ok(ServerName::IpAddress(remote.ip())),
        }
    }

    /// Server configuration from PEM certificate chain and private key
    pub fn server_config_from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        cipher_suites: Option<&[&str]>,
    ) -> Result<Arc<ServerConfig>> {
        let certs = read_certs(cert_pem)?;
        let key = read_private_key(key_pem)?;
        let builder = ServerConfig::builder();
        let config = match cipher_suites {
            Some(names) => builder
                .with_cipher_suites(&select_cipher_suites(names)?)
                .with_safe_default_kx_groups()
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(certs, key)?,
            None => builder
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(certs, key)?,
        };
        Ok(Arc::new(config))
    }

    /// Client configuration trusting the PEM certificates in `ca_pem`
    pub fn client_config_from_pem(ca_pem: &[u8]) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(ca_pem)? {
            roots.add(&cert).map_err(|e| Error::Tls(e.to_string()))?;
        }
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Resolves cipher-suite names such as `TLS13_AES_128_GCM_SHA256`
pub fn select_cipher_suites(names: &[&str]) -> Result<Vec<SupportedCipherSuite>> {
    let mut selected = Vec::with_capacity(names.len());
    for name in names {
        let suite = rustls::ALL_CIPHER_SUITES
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Tls(format!("unknown cipher suite {}", name)))?;
        selected.push(*suite);
    }
    if selected.is_empty() {
        return Err(Error::Tls("empty cipher suite list".into()));
    }
    Ok(selected)
}

fn read_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate found".into()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_private_key(pem: &[u8]) -> Result<PrivateKey> {
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut &pem[..])?.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut &pem[..])?.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    if let Some(key) = rustls_pemfile::ec_private_keys(&mut &pem[..])?.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    Err(Error::Tls("no private key found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn test_cipher_suite_allow_list() {
        let suites = select_cipher_suites(&["TLS13_AES_128_GCM_SHA256", "tls13_aes_256_gcm_sha384"]).unwrap();
        assert_eq!(suites.len(), 2);
        assert!(select_cipher_suites(&["TLS_NULL_WITH_NULL_NULL_BOGUS"]).is_err());
        assert!(select_cipher_suites(&[]).is_err());
    }

    #[test]
    fn test_context_from_pem() {
        let (cert, key) = self_signed();
        let server = TlsContext::server_config_from_pem(
            cert.as_bytes(),
            key.as_bytes(),
            Some(&["TLS13_AES_128_GCM_SHA256"]),
        )
        .unwrap();
        let client = TlsContext::client_config_from_pem(cert.as_bytes()).unwrap();

        let context = TlsContext::new()
            .with_server_config(server)
            .with_client_config(client)
            .with_server_name("localhost");
        assert!(context.acceptor().is_ok());
        assert!(context.connector().is_ok());
        assert!(context.server_name_for("127.0.0.1:5061".parse().unwrap()).is_ok());
        assert!(TlsContext::new().acceptor().is_err());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let (cert, _) = self_signed();
        assert!(TlsContext::server_config_from_pem(cert.as_bytes(), b"", None).is_err());
    }
}
