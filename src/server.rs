//! Proxy listener and connection dispatcher.
use std::sync::Arc;

use http::Method;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::capture::{CaptureSink, SqliteSink};
use crate::config::{ProxyConfig, SignerConfig};
use crate::errors::{Error, Result};
use crate::hijack::{Downstream, ResponseWriter};
use crate::mint::{CertificateMinter, CertificateSigner, CommandSigner, HostKey, RcgenSigner};
use crate::redirect::Policy;
use crate::relay::PlainRelay;
use crate::tunnel::Tunnel;
use crate::Response;

/// Accepts proxy connections and routes each request to the relay or the tunnel.
#[derive(Clone)]
pub struct ProxyServer {
  relay: Arc<PlainRelay>,
  tunnel: Arc<Tunnel>,
}

impl ProxyServer {
  /// Serve with an already assembled relay and tunnel.
  pub fn new(relay: PlainRelay, tunnel: Tunnel) -> ProxyServer {
    ProxyServer {
      relay: Arc::new(relay),
      tunnel: Arc::new(tunnel),
    }
  }

  /// Assemble the proxy from configuration.
  ///
  /// The host key, CA material and capture database are opened here, once; any failure is
  /// fatal to startup.
  pub async fn from_config(config: &ProxyConfig) -> Result<ProxyServer> {
    let host_key = Arc::new(HostKey::load(&config.host_key_path).await?);
    let signer: Arc<dyn CertificateSigner> = match &config.signer {
      SignerConfig::Command { program } => Arc::new(CommandSigner::new(program.clone())),
      SignerConfig::InProcess {
        ca_cert_path,
        ca_key_path,
      } => Arc::new(RcgenSigner::from_files(ca_cert_path, ca_key_path, &host_key).await?),
    };
    let mut minter = CertificateMinter::new(signer, host_key);
    if let Some(ttl) = config.cert_cache_ttl() {
      minter = minter.with_cache_ttl(ttl);
    }
    let sink: Arc<dyn CaptureSink> = Arc::new(SqliteSink::open(&config.database_path)?);
    let client = config
      .upstream
      .client_builder(Policy::none())
      .await?
      .build()?;
    let relay = PlainRelay::new(client.clone(), sink.clone());
    let mut tunnel = Tunnel::new(Arc::new(minter), client);
    if config.capture_tunnel {
      tunnel = tunnel.with_capture(sink);
    }
    Ok(ProxyServer::new(relay, tunnel))
  }

  /// Bind `addr` and serve until the process exits.
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::Other(format!("failed to bind to {addr}: {e}")))?;
    if let Ok(local) = listener.local_addr() {
      tracing::info!("listening on {}", local);
    }
    self.serve(listener).await
  }

  /// Accept connections from `listener`, one task per connection.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", err);
          }
          let server = self.clone();
          tokio::spawn(
            async move {
              if let Err(err) = server.handle_connection(stream).await {
                tracing::debug!("connection ended: {}", err);
              }
            }
            .instrument(tracing::info_span!("conn", peer = %peer)),
          );
        }
        Err(err) => {
          tracing::error!("failed to accept connection: {}", err);
        }
      }
    }
  }

  /// Dispatch every request on one client connection.
  ///
  /// `CONNECT` hands the connection over to the tunnel; anything else goes through the plain
  /// relay, and the connection is reused while both sides allow keep-alive.
  pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut downstream = Downstream::new(stream);
    loop {
      let request = match downstream.read_request().await {
        Ok(Some(request)) => request,
        Ok(None) => break,
        Err(err) => {
          if err.is_client_error() {
            let response = Response::error(err.status_code(), &err.to_string());
            downstream.write_response(&response).await.ok();
          }
          downstream.shutdown().await.ok();
          return Err(err);
        }
      };
      if request.method() == Method::CONNECT {
        tracing::debug!("CONNECT {}", request.uri());
        return self.tunnel.intercept(downstream, &request).await.map(|_| ());
      }
      let keep_alive = request.wants_keep_alive();
      let response = self.relay.relay(request).await;
      downstream.write_response(&response).await?;
      if !(keep_alive && response.allows_keep_alive()) {
        break;
      }
    }
    downstream.shutdown().await.ok();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mint::tests::{test_ca, test_minter};
  use crate::Client;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn server() -> (ProxyServer, Arc<SqliteSink>) {
    let client = Client::builder()
      .native_roots(false)
      .redirect(Policy::none())
      .build()
      .unwrap();
    let sink = Arc::new(SqliteSink::in_memory().unwrap());
    let relay = PlainRelay::new(client.clone(), sink.clone());
    let tunnel = Tunnel::new(Arc::new(test_minter(&test_ca())), client);
    (ProxyServer::new(relay, tunnel), sink)
  }

  #[tokio::test]
  async fn malformed_request_line_gets_400() {
    let (server, _) = server();
    let (mut client, io) = tokio::io::duplex(4096);
    client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    assert!(server.handle_connection(io).await.is_err());
    let mut seen = String::new();
    client.read_to_string(&mut seen).await.unwrap();
    assert!(seen.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{seen}");
  }

  #[tokio::test]
  async fn keep_alive_serves_several_requests() {
    let (server, sink) = server();
    let (mut client, io) = tokio::io::duplex(4096);
    client
      .write_all(
        b"GET https://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n\
          GET ftp://b.test/ HTTP/1.1\r\nHost: b.test\r\n\r\n",
      )
      .await
      .unwrap();
    client.shutdown().await.unwrap();
    server.handle_connection(io).await.unwrap();
    let mut seen = String::new();
    client.read_to_string(&mut seen).await.unwrap();
    assert_eq!(seen.matches("HTTP/1.1 400 Bad Request").count(), 2, "{seen}");
    assert!(seen.contains("unsupported protocol: https\n"));
    assert!(seen.contains("unsupported protocol: ftp\n"));
    assert!(sink.list_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn connection_close_ends_the_loop() {
    let (server, _) = server();
    let (mut client, io) = tokio::io::duplex(4096);
    client
      .write_all(
        b"GET https://a.test/ HTTP/1.1\r\nConnection: close\r\n\r\n\
          GET https://a.test/ HTTP/1.1\r\n\r\n",
      )
      .await
      .unwrap();
    server.handle_connection(io).await.unwrap();
    let mut seen = String::new();
    client.read_to_string(&mut seen).await.unwrap();
    assert_eq!(seen.matches("HTTP/1.1 400").count(), 1, "{seen}");
  }
}
