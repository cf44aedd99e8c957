use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{IgnoreHostname, NoVerifier};
use crate::Certificate;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  hostname_verification: bool,
  certs_verification: bool,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  tls_sni: bool,
  native_roots: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      hostname_verification: true,
      certs_verification: true,
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      keepalive: false,
      tls_sni: true,
      native_roots: true,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of hostname verification.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// If invalid hostnames are trusted, *any* valid certificate for *any* site will be trusted
  /// for use.
  pub fn hostname_verification(mut self, value: bool) -> ConnectorBuilder {
    self.hostname_verification = value;
    self
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `true`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site will be trusted
  /// for use. This includes expired certificates.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Controls the use of Server Name Indication (SNI).
  ///
  /// Defaults to `true`.
  pub fn tls_sni(mut self, value: bool) -> ConnectorBuilder {
    self.tls_sni = value;
    self
  }
  /// Trust the platform's root store in addition to added certificates.
  ///
  /// Defaults to `true`.
  pub fn native_roots(mut self, value: bool) -> ConnectorBuilder {
    self.native_roots = value;
    self
  }
  /// Adds certificates to the set of roots that the connector will trust.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if self.native_roots {
      let native = rustls_native_certs::load_native_certs();
      for err in native.errors.iter() {
        tracing::debug!("skipping native root: {}", err);
      }
      let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
      tracing::debug!("loaded {} native roots, ignored {}", added, ignored);
    }
    for cert in self.certificate.clone() {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    let provider = rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let signature_algorithms = provider.signature_verification_algorithms;
    let config_builder = rustls::ClientConfig::builder_with_provider(provider.clone())
      .with_protocol_versions(rustls::ALL_VERSIONS)
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?;
    let config_builder = if !self.certs_verification {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else if !self.hostname_verification {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(IgnoreHostname::new(
          root_cert_store,
          signature_algorithms,
        )))
    } else {
      config_builder.with_root_certificates(root_cert_store)
    };
    let mut tls = config_builder.with_no_client_auth();
    tls.enable_sni = self.tls_sni;
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Opens outbound connections to origin servers.
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(MaybeTlsStream::Tcp(s), self.write_timeout))
  }
  /// Connect to the origin named by an absolute `http` or `https` URI.
  ///
  /// Every resolved address is tried in turn; the last failure is returned.
  pub async fn connect_with_uri(&self, target: &http::Uri) -> Result<Socket> {
    let https = match target.scheme_str() {
      Some("http") => false,
      Some("https") => true,
      other => {
        return Err(Error::UnsupportedScheme(
          other.unwrap_or_default().to_string(),
        ))
      }
    };
    let host = target
      .host()
      .ok_or_else(|| Error::invalid_request(format!("missing host in {target}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!("connected to {} ({})", target, addr);
          return if https {
            self.upgrade_to_tls(socket, host).await
          } else {
            Ok(socket)
          };
        }
        Err(err) => last_error = Some(err),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no address found for {host}"),
      )
    }))
  }
  /// Upgrade an established connection with a TLS client handshake for `domain`.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::Other(e.to_string()))?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await?;
    Ok(tls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn rejects_non_http_schemes() {
    let connector = ConnectorBuilder::default()
      .native_roots(false)
      .build()
      .unwrap();
    let uri: http::Uri = "ftp://example.com/file".parse().unwrap();
    let err = connector.connect_with_uri(&uri).await.err().unwrap();
    assert_eq!(err.to_string(), "unsupported protocol: ftp");
  }

  #[tokio::test]
  async fn connects_to_plain_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = ConnectorBuilder::default()
      .native_roots(false)
      .build()
      .unwrap();
    let uri: http::Uri = format!("http://{addr}/").parse().unwrap();
    let socket = connector.connect_with_uri(&uri).await.unwrap();
    assert!(!socket.is_tls());
    assert_eq!(socket.peer_addr().unwrap(), addr);
  }
}
