//! TLS configuration and types
//!
use std::io::{BufRead, BufReader, Cursor};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  ServerConfig, SignatureScheme,
};

use crate::errors::{Error, Result};

/// Represents a server X509 certificate.
#[derive(Clone, Debug)]
pub struct Certificate {
  original: Cert,
}
#[derive(Clone, Debug)]
enum Cert {
  Der(Vec<u8>),
  Pem(Vec<u8>),
}
impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Result<Certificate> {
    Ok(Certificate {
      original: Cert::Der(der.to_owned()),
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate
  ///
  /// # Examples
  ///
  /// ```
  /// # use std::fs::File;
  /// # use std::io::Read;
  /// # fn cert() -> Result<(), Box<dyn std::error::Error>> {
  /// let mut buf = Vec::new();
  /// File::open("ca.crt")?
  ///     .read_to_end(&mut buf)?;
  /// let cert = ballista::Certificate::from_pem(&buf)?;
  /// # drop(cert);
  /// # Ok(())
  /// # }
  /// ```
  pub fn from_pem(pem: &[u8]) -> Result<Certificate> {
    Ok(Certificate {
      original: Cert::Pem(pem.to_owned()),
    })
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem_bundle);

    Self::read_pem_certs(&mut reader)?
      .iter()
      .map(|cert_vec| Certificate::from_der(cert_vec))
      .collect::<Result<Vec<Certificate>>>()
  }

  pub(crate) fn add_to_tls(self, root_cert_store: &mut RootCertStore) -> Result<()> {
    match self.original {
      Cert::Der(buf) => root_cert_store
        .add(buf.into())
        .map_err(crate::errors::builder)?,
      Cert::Pem(buf) => {
        let mut reader = Cursor::new(buf);
        let certs = Self::read_pem_certs(&mut reader)?;
        for c in certs {
          root_cert_store
            .add(c.into())
            .map_err(crate::errors::builder)?;
        }
      }
    }
    Ok(())
  }

  fn read_pem_certs(reader: &mut impl BufRead) -> Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(reader)
      .map(|result| match result {
        Ok(cert) => Ok(cert.as_ref().to_vec()),
        Err(_) => Err(crate::errors::builder("invalid certificate encoding")),
      })
      .collect()
  }
}

/// Parse a certificate chain, leaf first.
///
/// Input starting with a PEM armor line is read as a PEM bundle, anything else as a single
/// DER certificate.
pub fn parse_certificate_chain(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let trimmed = bytes.trim_ascii_start();
  if trimmed.is_empty() {
    return Err(Error::certificate_error("empty certificate output"));
  }
  if !trimmed.starts_with(b"-----BEGIN") {
    return Ok(vec![CertificateDer::from(trimmed.to_vec())]);
  }
  let chain = rustls_pemfile::certs(&mut Cursor::new(trimmed))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::certificate_error(format!("invalid PEM certificate: {e}")))?;
  if chain.is_empty() {
    return Err(Error::certificate_error("no certificate in PEM output"));
  }
  Ok(chain)
}

/// Load the first private key of a PEM document (PKCS#8, PKCS#1 or SEC1).
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
  rustls_pemfile::private_key(&mut Cursor::new(pem))
    .map_err(|e| Error::certificate_error(format!("invalid private key PEM: {e}")))?
    .ok_or_else(|| Error::certificate_error("no private key found"))
}

/// Server side TLS configuration for an intercepted tunnel.
///
/// Every protocol version rustls implements is offered, the server picks the cipher suite,
/// key exchange prefers X25519 over P-256 and only `http/1.1` is advertised.
pub fn mitm_server_config(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let provider = CryptoProvider {
    kx_groups: vec![ring::kx_group::X25519, ring::kx_group::SECP256R1],
    ..ring::default_provider()
  };
  let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
    .with_protocol_versions(rustls::ALL_VERSIONS)?
    .with_no_client_auth()
    .with_single_cert(chain, key)?;
  config.ignore_client_order = true;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(config)
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
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Chain validation against the roots without matching the server name.
#[derive(Debug)]
pub(crate) struct IgnoreHostname {
  roots: RootCertStore,
  signature_algorithms: WebPkiSupportedAlgorithms,
}

impl IgnoreHostname {
  pub(crate) fn new(roots: RootCertStore, signature_algorithms: WebPkiSupportedAlgorithms) -> Self {
    Self {
      roots,
      signature_algorithms,
    }
  }
}

impl ServerCertVerifier for IgnoreHostname {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    let cert = ParsedCertificate::try_from(end_entity)?;

    rustls::client::verify_server_cert_signed_by_trust_anchor(
      &cert,
      &self.roots,
      intermediates,
      now,
      self.signature_algorithms.all,
    )?;
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.signature_algorithms.supported_schemes()
  }
}
