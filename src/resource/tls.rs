//! # TLS Config Factory
//!
//! Builds a rustls server config for the manager's current TLS certificate, so a
//! listener can pick up a rotated certificate on its next handshake.

use crate::errors::{Error, Result};
use crate::manager::CredentialManager;
use crate::resource::{ResourceClient, ResourceFactory};
use crate::secrets::{Leased, TlsCert};
use async_trait::async_trait;
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;

/// Client handing out the server config for the current certificate.
pub type TlsConfigClient = ResourceClient<TlsConfigFactory>;

/// Build a server config from a certificate chain and key.
pub fn server_config(cert: &TlsCert) -> Result<ServerConfig> {
    let chain: Vec<CertificateDer<'static>> =
        CertificateDer::pem_slice_iter(cert.certificate_pem.as_bytes())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::invalid_certificate(format!("malformed certificate PEM: {}", e)))?;

    let key = PrivateKeyDer::from_pem_slice(cert.private_key_pem.expose_secret().as_bytes())
        .map_err(|e| Error::invalid_certificate(format!("malformed private key PEM: {}", e)))?;

    let provider = rustls::crypto::ring::default_provider();
    let config = ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(config)
}

/// Builds one server config per TLS credential.
pub struct TlsConfigFactory {
    manager: Arc<CredentialManager>,
}

impl TlsConfigFactory {
    pub fn new(manager: Arc<CredentialManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ResourceFactory for TlsConfigFactory {
    type Credential = TlsCert;
    type Resource = ServerConfig;

    async fn credential(&self) -> Result<Arc<Leased<TlsCert>>> {
        self.manager.tls_cert_secret().await
    }

    async fn connect(&self, credential: &Leased<TlsCert>) -> Result<ServerConfig> {
        let config = server_config(credential)?;
        tracing::info!(
            subject = %credential.subject,
            not_after = %credential.not_after,
            secret_id = %credential.id(),
            "TLS server config built"
        );
        Ok(config)
    }

    async fn close(&self, _config: &ServerConfig) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretString;

    fn self_signed() -> TlsCert {
        let cert = rcgen::generate_simple_self_signed(vec!["app.internal".to_string()]).unwrap();
        TlsCert::from_pem(cert.cert.pem(), SecretString::new(cert.key_pair.serialize_pem()))
            .unwrap()
    }

    #[test]
    fn test_server_config_from_certificate() {
        let config = server_config(&self_signed()).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_server_config_rejects_bad_key() {
        let broken = TlsCert { private_key_pem: SecretString::new("not a key"), ..self_signed() };
        let err = server_config(&broken).unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate { .. }));
    }
}
