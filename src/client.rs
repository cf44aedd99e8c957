use crate::errors::{new_io_error, Result};
use crate::redirect::{remove_sensitive_headers, resolve_location, Action, Policy};
use crate::response::{ResponseBuilder, ResponseConfig};
use crate::{Certificate, Connector, ConnectorBuilder, Request, Response};
use http::{HeaderValue, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// A `Client` to send requests to origin servers.
///
/// Every exchange uses a fresh connection that is closed afterwards; the proxy engine
/// never pools upstream connections. Cloning a `Client` is cheap.
///
/// # Examples
///
/// ```rust
/// # async fn run() -> Result<(), ballista::Error> {
/// let client = ballista::Client::builder().build()?;
/// let request: ballista::Request = ballista::Request::builder()
///     .uri("http://httpbin.org/get")
///     .body(Vec::new())?
///     .into();
/// let response = client.execute(request).await?;
/// #   Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientRef>,
}

struct ClientRef {
  connector: Arc<Connector>,
  redirect_policy: Policy,
  timeout: Option<Duration>,
}

impl Client {
  /// Creates a `ClientBuilder` to configure a `Client`.
  ///
  /// This is the same as `ClientBuilder::new()`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::new()
  }

  /// Send one request over an already prepared connection and read the response.
  async fn execute_request(&self, request: &Request) -> Result<Response> {
    let mut socket = self.inner.connector.connect_with_uri(request.uri()).await?;
    let raw = request.to_raw();
    socket.write_all(&raw).await?;
    socket.flush().await?;
    let reader = tokio::io::BufReader::new(socket);
    let mut response = ResponseBuilder::new(reader, ResponseConfig::new(request))
      .build()
      .await?;
    *response.url_mut() = request.uri().clone();
    Ok(response)
  }

  /// Executes a `Request`.
  ///
  /// The request must carry an absolute `http` or `https` URI. `Connection: close` is
  /// always sent. Redirects are followed according to the client's `redirect::Policy`; when
  /// the policy stops, the 3xx response itself is returned.
  ///
  /// # Errors
  ///
  /// This method fails if the origin could not be reached, answered something that is not
  /// HTTP/1.x, or the whole exchange took longer than the configured timeout.
  pub async fn execute<R: Into<Request>>(&self, request: R) -> Result<Response> {
    let request = request.into();
    match self.inner.timeout {
      None => self.follow(request).await,
      Some(t) => tokio::time::timeout(t, self.follow(request))
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "upstream exchange timed out"))?,
    }
  }

  async fn follow(&self, mut request: Request) -> Result<Response> {
    let mut uris = vec![];
    loop {
      request
        .headers_mut()
        .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
      let response = self.execute_request(&request).await?;
      let status = response.status_code();
      if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
          | StatusCode::FOUND
          | StatusCode::SEE_OTHER
          | StatusCode::TEMPORARY_REDIRECT
          | StatusCode::PERMANENT_REDIRECT
      ) {
        return Ok(response);
      }
      let next = match response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|l| l.to_str().ok())
        .and_then(|l| resolve_location(request.uri(), l))
      {
        Some(next) => next,
        None => return Ok(response),
      };
      uris.push(request.uri().clone());
      match self.inner.redirect_policy.check(&uris) {
        Action::Stop => return Ok(response),
        Action::Follow => {
          tracing::debug!("following {} redirect to {}", status, next);
          if matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
          ) {
            for header in &[
              http::header::TRANSFER_ENCODING,
              http::header::CONTENT_ENCODING,
              http::header::CONTENT_TYPE,
              http::header::CONTENT_LENGTH,
            ] {
              request.headers_mut().remove(header);
            }
            if !matches!(request.method(), &Method::GET | &Method::HEAD) {
              *request.method_mut() = Method::GET;
            }
            *request.body_mut() = None;
          }
          remove_sensitive_headers(request.headers_mut(), &next, &uris);
          request.headers_mut().remove(http::header::HOST);
          *request.uri_mut() = next;
        }
      }
    }
  }
}

/// A `ClientBuilder` can be used to create a `Client` with  custom configuration.
///
/// # Example
///
/// ```
/// # fn run() -> Result<(), ballista::Error> {
/// use std::time::Duration;
///
/// let client = ballista::Client::builder()
///     .timeout(Some(Duration::from_secs(10)))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
#[derive(Clone)]
pub struct ClientBuilder {
  config: Config,
}

#[derive(Clone)]
struct Config {
  timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  root_certs: Vec<Certificate>,
  native_roots: bool,
  hostname_verification: bool,
  certs_verification: bool,
  tls_sni: bool,
  redirect_policy: Policy,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      root_certs: vec![],
      native_roots: true,
      hostname_verification: true,
      certs_verification: true,
      tls_sni: true,
      redirect_policy: Policy::default(),
    }
  }
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientBuilder {
  /// Constructs a new `ClientBuilder`.
  pub fn new() -> ClientBuilder {
    ClientBuilder {
      config: Config::default(),
    }
  }
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  ///
  /// # Errors
  ///
  /// This method fails if a root certificate cannot be added to the TLS configuration.
  pub fn build(self) -> Result<Client> {
    let config = self.config;
    let connector = ConnectorBuilder::default()
      .connect_timeout(config.connect_timeout)
      .write_timeout(config.timeout)
      .nodelay(config.nodelay)
      .hostname_verification(config.hostname_verification)
      .certs_verification(config.certs_verification)
      .native_roots(config.native_roots)
      .certificate(config.root_certs)
      .tls_sni(config.tls_sni)
      .build()?;
    Ok(Client {
      inner: Arc::new(ClientRef {
        connector: Arc::new(connector),
        redirect_policy: config.redirect_policy,
        timeout: config.timeout,
      }),
    })
  }
  /// Set a `redirect::Policy` for this client.
  ///
  /// Default will follow redirects up to a maximum of 10.
  pub fn redirect(mut self, policy: Policy) -> ClientBuilder {
    self.config.redirect_policy = policy;
    self
  }
  /// Bound the whole exchange: connect, write, and reading the complete response.
  ///
  /// Default is 30 seconds. Pass `None` to disable timeout.
  pub fn timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase of a `Client`.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.config.connect_timeout = timeout;
    self
  }
  /// Set whether sockets have `TCP_NODELAY` enabled.
  ///
  /// Default is `true`.
  pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
    self.config.nodelay = enabled;
    self
  }
  /// Add a custom root certificate.
  ///
  /// This allows connecting to a server that has a self-signed
  /// certificate for example. This **does not** replace the existing
  /// trusted store.
  pub fn add_root_certificate(mut self, cert: Certificate) -> ClientBuilder {
    self.config.root_certs.push(cert);
    self
  }
  /// Trust the platform's root certificates.
  ///
  /// Defaults to `true`.
  pub fn native_roots(mut self, enabled: bool) -> ClientBuilder {
    self.config.native_roots = enabled;
    self
  }
  /// Controls the use of hostname verification.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// If hostname verification is not used, any valid certificate for any
  /// site will be trusted for use from any other.
  pub fn danger_accept_invalid_hostnames(mut self, accept_invalid_hostname: bool) -> ClientBuilder {
    self.config.hostname_verification = !accept_invalid_hostname;
    self
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use. This includes expired certificates.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.config.certs_verification = !accept_invalid_certs;
    self
  }
  /// Controls the use of TLS server name indication.
  ///
  /// Defaults to `true`.
  pub fn tls_sni(mut self, tls_sni: bool) -> ClientBuilder {
    self.config.tls_sni = tls_sni;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Answer each accepted connection with the next canned response and report what was sent.
  async fn origin(responses: Vec<&'static str>) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
      for response in responses {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        tx.send(String::from_utf8_lossy(&buf[..n]).to_string()).ok();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
      }
    });
    (addr, rx)
  }

  fn client(policy: Policy) -> Client {
    Client::builder()
      .native_roots(false)
      .redirect(policy)
      .build()
      .unwrap()
  }

  fn get(url: String) -> Request {
    Request::builder().uri(url).body(Vec::new()).unwrap().into()
  }

  #[tokio::test]
  async fn sends_connection_close_and_reads_response() {
    let (addr, mut sent) = origin(vec!["HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"]).await;
    let response = client(Policy::none())
      .execute(get(format!("http://{addr}/a?x=1")))
      .await
      .unwrap();
    assert_eq!(response.text(), "ok");
    let raw = sent.recv().await.unwrap();
    assert!(raw.starts_with("GET /a?x=1 HTTP/1.1\r\n"));
    assert!(raw.contains("connection: close\r\n"));
  }

  #[tokio::test]
  async fn none_policy_returns_redirect_unfollowed() {
    let (addr, _sent) = origin(vec!["HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n"]).await;
    let response = client(Policy::none())
      .execute(get(format!("http://{addr}/")))
      .await
      .unwrap();
    assert_eq!(response.status_code(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/next");
  }

  #[tokio::test]
  async fn see_other_switches_to_get() {
    let (addr, mut sent) = origin(vec![
      "HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n",
      "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
    ])
    .await;
    let request: Request = Request::builder()
      .method("POST")
      .uri(format!("http://{addr}/form"))
      .body(b"a=1".to_vec())
      .unwrap()
      .into();
    let response = client(Policy::default()).execute(request).await.unwrap();
    assert_eq!(response.text(), "done");
    assert!(sent.recv().await.unwrap().starts_with("POST /form "));
    let second = sent.recv().await.unwrap();
    assert!(second.starts_with("GET /done HTTP/1.1\r\n"), "{second}");
    assert_eq!(response.uri().path(), "/done");
  }

  #[tokio::test]
  async fn unreachable_origin_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    assert!(client(Policy::none())
      .execute(get(format!("http://{addr}/")))
      .await
      .is_err());
  }
}
