//! Proxy configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then `BALLISTA_*`
//! environment variables (`__` separates nested keys, e.g. `BALLISTA_UPSTREAM__TIMEOUT_SECS`).
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::redirect::Policy;
use crate::{Certificate, ClientBuilder};

/// Everything the proxy needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address the proxy listens on.
  pub listen_addr: String,
  /// Private key paired with every minted certificate, read once at startup.
  pub host_key_path: PathBuf,
  /// SQLite file receiving captured traffic, `:memory:` for a throwaway store.
  pub database_path: PathBuf,
  /// Capture requests relayed through intercepted tunnels as well.
  pub capture_tunnel: bool,
  /// Reuse minted certificates per host for this many seconds. Unset mints per session.
  pub cert_cache_ttl_secs: Option<u64>,
  /// How leaf certificates are signed.
  pub signer: SignerConfig,
  /// Outbound client settings.
  pub upstream: UpstreamConfig,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      listen_addr: "127.0.0.1:8080".to_string(),
      host_key_path: PathBuf::from("cert.key"),
      database_path: PathBuf::from("ballista.db"),
      capture_tunnel: false,
      cert_cache_ttl_secs: None,
      signer: SignerConfig::default(),
      upstream: UpstreamConfig::default(),
    }
  }
}

/// Leaf certificate signer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerConfig {
  /// External program run as `<program> <host> <serial>`, certificate on stdout.
  Command {
    /// program path
    program: PathBuf,
  },
  /// Sign in process with a CA certificate and key.
  InProcess {
    /// CA certificate, PEM
    ca_cert_path: PathBuf,
    /// CA private key, PEM
    ca_key_path: PathBuf,
  },
}

impl Default for SignerConfig {
  fn default() -> Self {
    SignerConfig::Command {
      program: PathBuf::from("./cert_gen.sh"),
    }
  }
}

/// Settings for the client that talks to origins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// Whole-exchange timeout per request.
  pub timeout_secs: u64,
  /// TCP connect timeout.
  pub connect_timeout_secs: u64,
  /// Skip origin certificate validation.
  pub accept_invalid_certs: bool,
  /// Skip origin hostname validation.
  pub accept_invalid_hostnames: bool,
  /// Extra PEM bundles trusted for origins.
  pub root_certificates: Vec<PathBuf>,
  /// Trust the platform's root store.
  pub native_roots: bool,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    UpstreamConfig {
      timeout_secs: 30,
      connect_timeout_secs: 10,
      accept_invalid_certs: false,
      accept_invalid_hostnames: false,
      root_certificates: Vec::new(),
      native_roots: true,
    }
  }
}

impl UpstreamConfig {
  /// Client builder for these settings. Proxy paths pass [`Policy::none`].
  pub async fn client_builder(&self, policy: Policy) -> Result<ClientBuilder> {
    let mut builder = ClientBuilder::new()
      .redirect(policy)
      .timeout(Some(Duration::from_secs(self.timeout_secs)))
      .connect_timeout(Some(Duration::from_secs(self.connect_timeout_secs)))
      .native_roots(self.native_roots)
      .danger_accept_invalid_certs(self.accept_invalid_certs)
      .danger_accept_invalid_hostnames(self.accept_invalid_hostnames);
    for path in &self.root_certificates {
      let pem = tokio::fs::read(path)
        .await
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
      for cert in Certificate::from_pem_bundle(&pem)? {
        builder = builder.add_root_certificate(cert);
      }
    }
    Ok(builder)
  }
}

impl ProxyConfig {
  /// Load defaults, then `file` if given, then the environment.
  pub fn load(file: Option<&Path>) -> Result<ProxyConfig> {
    let mut figment = Figment::from(Serialized::defaults(ProxyConfig::default()));
    if let Some(file) = file {
      if !file.exists() {
        return Err(Error::Config(format!("{} does not exist", file.display())));
      }
      figment = figment.merge(Toml::file(file));
    }
    figment
      .merge(Env::prefixed("BALLISTA_").split("__"))
      .extract()
      .map_err(|e| Error::Config(e.to_string()))
  }

  /// Certificate cache lifetime, if caching is enabled.
  pub fn cert_cache_ttl(&self) -> Option<Duration> {
    self.cert_cache_ttl_secs.map(Duration::from_secs)
  }
}
