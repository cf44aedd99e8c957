//! Certificate minting for intercepted hosts.
//!
//! Every leaf is issued for the one fixed host key loaded at startup. The signer that turns
//! `(host, serial)` into a certificate sits behind [`CertificateSigner`]: either an external
//! program ([`CommandSigner`]) or an in-process CA ([`RcgenSigner`]).
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;

use crate::errors::{Error, Result};
use crate::tls::{mitm_server_config, parse_certificate_chain, parse_private_key};

/// Leaf validity in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before to tolerate client clock skew
const NOT_BEFORE_OFFSET: i64 = 60;

/// The fixed private key every minted leaf is issued for.
pub struct HostKey {
  pem: String,
  der: PrivateKeyDer<'static>,
}

impl HostKey {
  /// Read the key from disk. Called once at startup; a failure there is fatal.
  pub async fn load(path: impl AsRef<Path>) -> Result<HostKey> {
    let path = path.as_ref();
    let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
      Error::certificate_error(format!("cannot read host key {}: {}", path.display(), e))
    })?;
    Self::from_pem(&pem)
  }

  /// Parse a PEM encoded key (PKCS#8, PKCS#1 or SEC1).
  pub fn from_pem(pem: &str) -> Result<HostKey> {
    let der = parse_private_key(pem.as_bytes())?;
    Ok(HostKey {
      pem: pem.to_string(),
      der,
    })
  }

  fn der(&self) -> PrivateKeyDer<'static> {
    self.der.clone_key()
  }
}

/// Issues a leaf certificate for `host` with the given serial, signed by the root key.
///
/// Returns PEM or DER bytes, leaf first.
#[async_trait]
pub trait CertificateSigner: Send + Sync {
  /// Sign a certificate for `host`.
  async fn sign(&self, host: &str, serial: u64) -> Result<Vec<u8>>;
}

/// Runs `<program> <host> <serial>` and reads the certificate from its standard output.
#[derive(Debug, Clone)]
pub struct CommandSigner {
  program: PathBuf,
}

impl CommandSigner {
  /// Signer backed by the given program.
  pub fn new(program: impl Into<PathBuf>) -> CommandSigner {
    CommandSigner {
      program: program.into(),
    }
  }
}

#[async_trait]
impl CertificateSigner for CommandSigner {
  async fn sign(&self, host: &str, serial: u64) -> Result<Vec<u8>> {
    let output = tokio::process::Command::new(&self.program)
      .arg(host)
      .arg(serial.to_string())
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| {
        Error::certificate_error(format!("cannot run {}: {}", self.program.display(), e))
      })?;
    if !output.status.success() {
      return Err(Error::certificate_error(format!(
        "{} failed for {} ({}): {}",
        self.program.display(),
        host,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      )));
    }
    if output.stdout.is_empty() {
      return Err(Error::certificate_error(format!(
        "{} returned no certificate for {}",
        self.program.display(),
        host
      )));
    }
    Ok(output.stdout)
  }
}

/// In-process signer backed by a CA certificate and key.
pub struct RcgenSigner {
  issuer: Issuer<'static, KeyPair>,
  ca_pem: String,
  host_key: KeyPair,
}

impl RcgenSigner {
  /// Build a signer from PEM encoded CA material.
  ///
  /// The host key has to be PKCS#8 for in-process signing.
  pub fn new(ca_cert_pem: &str, ca_key_pem: &str, host_key: &HostKey) -> Result<RcgenSigner> {
    let ca_key = KeyPair::from_pem(ca_key_pem)
      .map_err(|e| Error::certificate_error(format!("failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
      .map_err(|e| Error::certificate_error(format!("failed to create issuer from CA cert: {e}")))?;
    let host_key = KeyPair::from_pem(&host_key.pem)
      .map_err(|e| Error::certificate_error(format!("host key unusable for signing: {e}")))?;
    Ok(RcgenSigner {
      issuer,
      ca_pem: ca_cert_pem.to_string(),
      host_key,
    })
  }

  /// Load the CA certificate and key from disk.
  pub async fn from_files(
    ca_cert_path: impl AsRef<Path>,
    ca_key_path: impl AsRef<Path>,
    host_key: &HostKey,
  ) -> Result<RcgenSigner> {
    let read = |path: &Path| {
      let path = path.to_path_buf();
      async move {
        tokio::fs::read_to_string(&path)
          .await
          .map_err(|e| Error::certificate_error(format!("cannot read {}: {}", path.display(), e)))
      }
    };
    let cert = read(ca_cert_path.as_ref()).await?;
    let key = read(ca_key_path.as_ref()).await?;
    Self::new(&cert, &key, host_key)
  }
}

#[async_trait]
impl CertificateSigner for RcgenSigner {
  async fn sign(&self, host: &str, serial: u64) -> Result<Vec<u8>> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(serial.into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid domain name: {host}"))
      })?)],
    };
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);
    let cert = params
      .signed_by(&self.host_key, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign {host}: {e}")))?;
    Ok(format!("{}{}", cert.pem(), self.ca_pem).into_bytes())
  }
}

/// Produces the TLS server configuration presented to an intercepted client.
pub struct CertificateMinter {
  signer: Arc<dyn CertificateSigner>,
  host_key: Arc<HostKey>,
  cache: Option<Cache<String, Arc<ServerConfig>>>,
}

impl CertificateMinter {
  /// Mint a fresh certificate for every session.
  pub fn new(signer: Arc<dyn CertificateSigner>, host_key: Arc<HostKey>) -> CertificateMinter {
    CertificateMinter {
      signer,
      host_key,
      cache: None,
    }
  }

  /// Reuse a minted configuration per host for `ttl`.
  pub fn with_cache_ttl(mut self, ttl: std::time::Duration) -> CertificateMinter {
    self.cache = Some(
      Cache::builder()
        .max_capacity(1000)
        .time_to_live(ttl)
        .build(),
    );
    self
  }

  /// Mint a certificate for `host` and wrap it in a MITM server configuration.
  pub async fn mint(&self, host: &str) -> Result<Arc<ServerConfig>> {
    if let Some(cache) = &self.cache {
      if let Some(config) = cache.get(host).await {
        tracing::debug!(host, "reusing cached certificate");
        return Ok(config);
      }
    }
    // 63-bit, never negative as a serial
    let serial = rand::random::<u64>() >> 1;
    let bytes = self.signer.sign(host, serial).await?;
    let chain = parse_certificate_chain(&bytes)?;
    let config = mitm_server_config(chain, self.host_key.der()).map_err(|e| {
      Error::certificate_error(format!("minted certificate for {host} unusable: {e}"))
    })?;
    let config = Arc::new(config);
    tracing::debug!(host, serial, "minted certificate");
    if let Some(cache) = &self.cache {
      cache.insert(host.to_string(), config.clone()).await;
    }
    Ok(config)
  }
}
