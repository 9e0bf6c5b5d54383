//! TLS configuration and types
//!
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  RootCertStore, ServerConfig, SignatureScheme,
};

use crate::errors::{Error, Result};

const ALPN_HTTP1: &[u8] = b"http/1.1";

pub(crate) fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Client configuration for upstream connections.
///
/// With `verify` set, servers are checked against the platform trust store
/// plus `extra_roots`; otherwise any certificate is accepted.
pub fn client_config(verify: bool, extra_roots: &[CertificateDer<'static>]) -> Result<Arc<ClientConfig>> {
  let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let mut config = if verify {
    let mut root_cert_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
      tracing::warn!("skipping platform root store entry: {}", err);
    }
    let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
    tracing::debug!("loaded {} platform roots, ignored {}", added, ignored);
    for cert in extra_roots {
      root_cert_store.add(cert.clone())?;
    }
    builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(Arc::new(config))
}

/// Server configuration presenting `chain` to intercepted clients.
///
/// Client certificates are optional; when one is offered it must chain to `root`.
pub(crate) fn mitm_server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  root: &CertificateDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let provider = provider();
  let mut roots = RootCertStore::empty();
  roots.add(root.clone())?;
  let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
    .allow_unauthenticated()
    .build()
    .map_err(|e| Error::tls_error(format!("client verifier: {}", e)))?;
  let mut config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()?
    .with_client_cert_verifier(verifier)
    .with_single_cert(chain, key)?;
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(Arc::new(config))
}

/// Parses a server name for SNI and verification.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_owned())
    .map_err(|e| Error::tls_error(format!("invalid server name {:?}: {}", host, e)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_config_offers_http1() {
    let config = client_config(false, &[]).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn server_names_accept_hosts_and_ips() {
    assert!(server_name("example.com").is_ok());
    assert!(server_name("127.0.0.1").is_ok());
    assert!(server_name("not a host").is_err());
  }
}
