//! TLS interception tunnel.
//!
//! A `CONNECT` is answered by taking over the raw connection, minting a certificate for the
//! requested host, terminating the client's TLS session with it and relaying every decrypted
//! request to the real origin over a fresh outbound TLS connection.
//!
//! ```text
//! Hijacking -> CertMinting -> Handshaking -> RelayLoop -> Closed
//!      \____________\______________\____________\______> Aborted
//! ```
use std::fmt;
use std::sync::Arc;

use http::{HeaderValue, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;

use crate::capture::CaptureSink;
use crate::errors::{Error, Result};
use crate::hijack::{Hijacker, ResponseWriter};
use crate::mint::CertificateMinter;
use crate::request::RequestReader;
use crate::{Client, Request, Response};

/// Written on the raw connection before the TLS handshake.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Lifecycle of one intercepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// taking over the client connection
  Hijacking,
  /// minting the leaf certificate
  CertMinting,
  /// TLS handshake with the client
  Handshaking,
  /// relaying decrypted requests
  RelayLoop,
  /// the client closed the tunnel
  Closed,
  /// an unrecoverable error ended the tunnel
  Aborted,
}

impl TunnelState {
  fn is_terminal(self) -> bool {
    matches!(self, TunnelState::Closed | TunnelState::Aborted)
  }
}

impl fmt::Display for TunnelState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

// Tracks the current state; leaving scope in a non-terminal state means the tunnel aborted.
struct Session<'a> {
  authority: &'a str,
  state: TunnelState,
}

impl<'a> Session<'a> {
  fn new(authority: &'a str) -> Session<'a> {
    tracing::debug!(authority, state = %TunnelState::Hijacking, "tunnel state");
    Session {
      authority,
      state: TunnelState::Hijacking,
    }
  }

  fn enter(&mut self, state: TunnelState) {
    tracing::debug!(authority = self.authority, from = %self.state, state = %state, "tunnel state");
    self.state = state;
  }
}

impl Drop for Session<'_> {
  fn drop(&mut self) {
    if !self.state.is_terminal() {
      tracing::warn!(authority = self.authority, during = %self.state, "tunnel aborted");
      self.state = TunnelState::Aborted;
    }
  }
}

/// Hop-by-hop headers that would end the tunnel if relayed back from the origin.
const TUNNEL_HOP_HEADERS: [&str; 3] = ["connection", "keep-alive", "proxy-connection"];

/// The interception engine shared by all connections.
pub struct Tunnel {
  minter: Arc<CertificateMinter>,
  client: Client,
  sink: Option<Arc<dyn CaptureSink>>,
}

impl Tunnel {
  /// Intercept with `minter`, forward with `client`. The client should not follow redirects.
  pub fn new(minter: Arc<CertificateMinter>, client: Client) -> Tunnel {
    Tunnel {
      minter,
      client,
      sink: None,
    }
  }

  /// Also capture the requests relayed through tunnels.
  pub fn with_capture(mut self, sink: Arc<dyn CaptureSink>) -> Tunnel {
    self.sink = Some(sink);
    self
  }

  /// Run one intercepted session to completion.
  ///
  /// Returns the number of requests relayed once the client closes the tunnel. Any error
  /// aborts this tunnel only.
  pub async fn intercept<H>(&self, mut downstream: H, connect: &Request) -> Result<usize>
  where
    H: Hijacker + ResponseWriter + Send,
  {
    let authority = connect
      .uri()
      .authority()
      .map(|a| a.to_string())
      .unwrap_or_default();
    let mut session = Session::new(&authority);

    downstream.write_header(StatusCode::OK);
    if !downstream.can_hijack() {
      downstream.finish().await.ok();
      return Err(Error::hijack_error("connection does not support hijacking"));
    }
    let host = match connect_host(connect) {
      Ok(host) => host,
      Err(err) => {
        let response = Response::error(err.status_code(), &err.to_string());
        downstream.write_response(&response).await.ok();
        return Err(err);
      }
    };
    let conn = downstream.hijack()?;

    session.enter(TunnelState::CertMinting);
    let config = self.minter.mint(&host).await?;

    session.enter(TunnelState::Handshaking);
    let mut conn = conn;
    conn.write_all(CONNECT_ESTABLISHED).await?;
    conn.flush().await?;
    let tls = TlsAcceptor::from(config)
      .accept(conn)
      .await
      .map_err(|e| Error::tls_error(format!("client handshake for {host} failed: {e}")))?;

    session.enter(TunnelState::RelayLoop);
    let mut stream = BufReader::new(tls);
    let relayed = self.relay_loop(&mut stream, &authority).await;
    stream.get_mut().shutdown().await.ok();
    let relayed = relayed?;
    session.enter(TunnelState::Closed);
    tracing::info!(%authority, relayed, "tunnel closed");
    Ok(relayed)
  }

  async fn relay_loop<S>(&self, stream: &mut BufReader<S>, authority: &str) -> Result<usize>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut relayed = 0;
    while let Some(mut request) = RequestReader::new(&mut *stream).read().await? {
      retarget(&mut request, authority)?;
      let uri = request.uri().clone();
      let request_id = match &self.sink {
        Some(sink) => sink
          .add_request(&request)
          .await
          .map_err(|e| tracing::warn!("request capture failed: {}", e))
          .ok(),
        None => None,
      };
      let mut response = self
        .client
        .execute(request)
        .await
        .map_err(|e| Error::upstream_error(format!("{uri}: {e}")))?;
      tracing::info!(request_id, "{} {}", uri, response.status_code());
      if let (Some(sink), Some(id)) = (&self.sink, request_id) {
        if let Err(err) = sink.add_response(&response, id).await {
          tracing::warn!(request_id = id, "response capture failed: {}", err);
        }
      }
      for name in TUNNEL_HOP_HEADERS {
        response.headers_mut().remove(name);
      }
      stream.write_all(&response.to_raw()).await?;
      stream.flush().await?;
      relayed += 1;
    }
    Ok(relayed)
  }
}

/// Bare host of a `CONNECT` target, brackets stripped from IPv6 literals.
fn connect_host(connect: &Request) -> Result<String> {
  if connect.method() != Method::CONNECT {
    return Err(Error::invalid_request("not a CONNECT request"));
  }
  let uri = connect.uri();
  match (uri.host(), uri.port_u16()) {
    (Some(host), Some(_)) if !host.is_empty() => Ok(
      host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string(),
    ),
    _ => Err(Error::invalid_request(format!(
      "CONNECT target must be host:port, got {uri}"
    ))),
  }
}

/// Point a request read inside the tunnel at the `CONNECT` authority over https, keeping
/// its path and query.
fn retarget(request: &mut Request, authority: &str) -> Result<()> {
  let path_and_query = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .filter(|pq| !pq.is_empty())
    .unwrap_or("/");
  let uri: http::Uri = format!("https://{authority}{path_and_query}").parse()?;
  *request.uri_mut() = uri;
  if request.headers().get(http::header::HOST).is_none() {
    request
      .headers_mut()
      .insert(http::header::HOST, HeaderValue::from_str(authority)?);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hijack::Downstream;
  use crate::mint::tests::{test_ca, test_minter};
  use crate::mint::{CertificateMinter, CommandSigner, HostKey};
  use crate::redirect::Policy;
  use tokio::io::AsyncReadExt;

  fn connect(target: &str) -> Request {
    Request::builder()
      .method("CONNECT")
      .uri(target)
      .body(Vec::new())
      .unwrap()
      .into()
  }

  fn client() -> Client {
    Client::builder()
      .native_roots(false)
      .redirect(Policy::none())
      .build()
      .unwrap()
  }

  #[test]
  fn retarget_keeps_path_and_query() {
    let mut request: Request = Request::builder()
      .uri("/search?q=a%20b&x=1")
      .body(Vec::new())
      .unwrap()
      .into();
    retarget(&mut request, "example.com:8443").unwrap();
    assert_eq!(request.uri(), "https://example.com:8443/search?q=a%20b&x=1");
    assert_eq!(request.headers()["host"], "example.com:8443");

    let mut absolute: Request = Request::builder()
      .uri("http://elsewhere/p")
      .header("Host", "example.com")
      .body(Vec::new())
      .unwrap()
      .into();
    retarget(&mut absolute, "example.com:443").unwrap();
    assert_eq!(absolute.uri(), "https://example.com:443/p");
    assert_eq!(absolute.headers()["host"], "example.com");
  }

  #[test]
  fn connect_host_needs_port() {
    assert_eq!(connect_host(&connect("example.com:443")).unwrap(), "example.com");
    assert_eq!(connect_host(&connect("[::1]:443")).unwrap(), "::1");
    assert!(connect_host(&connect("example.com")).is_err());
  }

  #[tokio::test]
  async fn non_hijackable_connection_aborts_before_minting() {
    let ca = test_ca();
    let tunnel = Tunnel::new(Arc::new(test_minter(&ca)), client());
    let (mut client_io, server_io) = tokio::io::duplex(1024);
    let downstream = Downstream::without_hijack(server_io);
    let err = tunnel
      .intercept(downstream, &connect("example.com:443"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Hijack(_)));
    let mut seen = String::new();
    client_io.read_to_string(&mut seen).await.unwrap();
    assert!(seen.starts_with("HTTP/1.1 200 OK\r\n"), "{seen}");
  }

  #[tokio::test]
  async fn mint_failure_writes_nothing() {
    let host_key = HostKey::from_pem(&rcgen::KeyPair::generate().unwrap().serialize_pem()).unwrap();
    let minter = CertificateMinter::new(Arc::new(CommandSigner::new("false")), Arc::new(host_key));
    let tunnel = Tunnel::new(Arc::new(minter), client());
    let (mut client_io, server_io) = tokio::io::duplex(1024);
    let err = tunnel
      .intercept(Downstream::new(server_io), &connect("example.com:443"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Certificate(_)));
    let mut seen = Vec::new();
    client_io.read_to_end(&mut seen).await.unwrap();
    assert!(seen.is_empty(), "no bytes before a usable certificate exists");
  }

  #[tokio::test]
  async fn malformed_target_is_answered_with_400() {
    let ca = test_ca();
    let tunnel = Tunnel::new(Arc::new(test_minter(&ca)), client());
    let (mut client_io, server_io) = tokio::io::duplex(1024);
    let result = tunnel
      .intercept(Downstream::new(server_io), &connect("example.com"))
      .await;
    assert!(result.is_err());
    let mut seen = String::new();
    client_io.read_to_string(&mut seen).await.unwrap();
    assert!(seen.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{seen}");
  }
}
