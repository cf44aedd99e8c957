use bytes::Bytes;
use http::{Method, Response as HttpResponse};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::{self, Body};
use crate::cookies;
use crate::errors::{new_io_error, Error, Result};
use crate::request::connection_allows_keep_alive;
use crate::{Request, COLON_SPACE, CR_LF, SPACE};

/// Reason phrase sent by the origin, kept so the status line is relayed as received.
#[derive(Clone, Debug, PartialEq)]
pub struct ReasonPhrase(pub Bytes);

/// A Response to a submitted `Request`.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  status_code: http::StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  extensions: http::Extensions,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      status_code: parts.status,
      headers: parts.headers,
      extensions: parts.extensions,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Serialize the response for the client.
  ///
  /// Headers are copied as received, with one exception: a body that was de-chunked
  /// while reading is re-framed with `Content-Length`, and a body the origin delimited by
  /// closing the connection gets an explicit `Content-Length` too. Replies to `HEAD` keep
  /// their headers untouched.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    http_response.extend(SPACE);
    match self.reason() {
      Some(reason) => http_response.extend(reason.as_ref()),
      None => http_response.extend(
        self
          .status_code
          .canonical_reason()
          .unwrap_or_default()
          .as_bytes(),
      ),
    }
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    let body_len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
    // framing headers of a HEAD reply describe a body that was never sent
    let head = self.extensions.get::<Method>() == Some(&Method::HEAD);
    if !head && body::is_chunked(&self.headers) {
      headers.remove(http::header::TRANSFER_ENCODING);
      headers.insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(body_len));
    } else if !head
      && !headers.contains_key(http::header::CONTENT_LENGTH)
      && status_has_body(self.status_code)
    {
      headers.insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(body_len));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// A plain-text error response, the way the proxy answers failures it can still report.
  pub fn error(status: http::StatusCode, msg: &str) -> Response {
    let mut response = Response {
      status_code: status,
      body: Some(Body::from(format!("{msg}\n"))),
      ..Response::default()
    };
    response.headers.insert(
      http::header::CONTENT_TYPE,
      http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers.insert(
      http::header::X_CONTENT_TYPE_OPTIONS,
      http::HeaderValue::from_static("nosniff"),
    );
    response
  }
}

impl Response {
  /// Retrieve the cookies contained in the response.
  ///
  /// Note that invalid 'Set-Cookie' headers will be ignored.
  pub fn cookies(&self) -> impl Iterator<Item = cookies::Cookie<'_>> {
    cookies::extract_response_cookies(&self.headers).filter_map(|x| x.ok())
  }
  /// Get the response text, replacing invalid UTF-8.
  pub fn text(&self) -> String {
    match self.body() {
      Some(b) => String::from_utf8_lossy(b).to_string(),
      None => String::new(),
    }
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// Get the reason phrase the origin sent, if it was read off the wire.
  pub fn reason(&self) -> Option<&Bytes> {
    self.extensions.get::<ReasonPhrase>().map(|r| &r.0)
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the final `http::Uri` of this `Response`.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  #[inline]
  pub(crate) fn url_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Mutable access to the buffered body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns a reference to the associated extensions.
  pub fn extensions(&self) -> &http::Extensions {
    &self.extensions
  }
  /// Returns a mutable reference to the associated extensions.
  pub fn extensions_mut(&mut self) -> &mut http::Extensions {
    &mut self.extensions
  }
  /// Whether the connection the response is written to may carry another request.
  pub fn allows_keep_alive(&self) -> bool {
    connection_allows_keep_alive(&self.headers, self.version)
  }
}

/// A builder to construct the properties of a `Response`.
///
/// To construct a `ResponseBuilder`, refer to the `Client` documentation.
#[derive(Debug)]
pub struct ResponseBuilder<T: AsyncRead> {
  builder: http::response::Builder,
  reader: BufReader<T>,
  config: ResponseConfig,
}

/// response config
#[derive(Debug, Default)]
pub struct ResponseConfig {
  method: Method,
}

impl ResponseConfig {
  /// new a response config
  pub fn new(request: &Request) -> Self {
    ResponseConfig {
      method: request.method().clone(),
    }
  }
}

impl<T: AsyncRead + Unpin + Sized> ResponseBuilder<T> {
  /// Constructs a new response.
  pub fn new(reader: BufReader<T>, config: ResponseConfig) -> ResponseBuilder<T> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      config,
    }
  }
  async fn parser_status_line(&mut self) -> Result<(http::Version, http::StatusCode, Bytes)> {
    let mut line = Vec::new();
    if self.reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before response",
      ));
    }
    let line = body::trim_line(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(v) if !v.is_empty() => parser_version(v)?,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version and status_code data",
        ));
      }
    };
    let sc = match parts.next() {
      Some(c) if !c.is_empty() => {
        http::StatusCode::from_bytes(c).map_err(|x| Error::Http(http::Error::from(x)))?
      }
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version and status_code data",
        ));
      }
    };
    let reason = Bytes::copy_from_slice(parts.next().unwrap_or_default());
    Ok((version, sc, reason))
  }
  async fn read_headers(&mut self) -> Result<http::HeaderMap> {
    let mut headers = http::HeaderMap::new();
    let mut header_line = Vec::new();
    loop {
      header_line.clear();
      let length = self.reader.read_until(b'\n', &mut header_line).await?;
      if length == 0 || body::trim_line(&header_line).is_empty() {
        break;
      }
      match parser_headers(&header_line) {
        Ok((Some(k), Some(v))) => {
          headers.append(k, v);
        }
        _ => tracing::debug!(
          "skipping malformed response header: {}",
          body::trim_line(&header_line).escape_ascii()
        ),
      }
    }
    Ok(headers)
  }
  async fn read_body(&mut self, status: http::StatusCode, header: &http::HeaderMap) -> Result<Vec<u8>> {
    if matches!(self.config.method, Method::HEAD) || !status_has_body(status) {
      return Ok(Vec::new());
    }
    if body::is_chunked(header) {
      return body::read_chunked(&mut self.reader).await;
    }
    if let Some(length) = body::content_length(header)? {
      return body::read_sized(&mut self.reader, length).await;
    }
    // delimited by the origin closing the connection
    let mut body = Vec::new();
    self.reader.read_to_end(&mut body).await?;
    Ok(body)
  }

  /// Read a complete `Response` off the stream.
  ///
  /// Interim `1xx` responses are read and dropped; the final response is returned. `101`
  /// counts as final.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c, reason, header) = loop {
      let (v, c, reason) = self.parser_status_line().await?;
      let header = self.read_headers().await?;
      if c.is_informational() && c != http::StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!("dropping interim response {}", c);
        continue;
      }
      break (v, c, reason, header);
    };
    self.builder = self.builder.version(v).status(c);
    let body = self.read_body(c, &header).await?;
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let mut resp: Response = self.builder.body(body)?.into();
    if !reason.is_empty() {
      resp.extensions_mut().insert(ReasonPhrase(reason));
    }
    resp.extensions_mut().insert(self.config.method);
    Ok(resp)
  }
}

fn status_has_body(status: http::StatusCode) -> bool {
  !(status.is_informational()
    || status == http::StatusCode::NO_CONTENT
    || status == http::StatusCode::NOT_MODIFIED)
}

pub(crate) fn parser_version(buffer: &[u8]) -> Result<http::Version> {
  match buffer {
    b"HTTP/0.9" => Ok(http::Version::HTTP_09),
    b"HTTP/1.0" => Ok(http::Version::HTTP_10),
    b"HTTP/1.1" => Ok(http::Version::HTTP_11),
    _ => Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "invalid http version",
    )),
  }
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = body::trim_line(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h.trim_ascii()) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn parse(raw: &'static [u8], method: Method) -> Result<Response> {
    let request: Request = Request::builder()
      .method(method)
      .uri("/")
      .body(Vec::new())
      .unwrap()
      .into();
    ResponseBuilder::new(BufReader::new(raw), ResponseConfig::new(&request))
      .build()
      .await
  }

  #[tokio::test]
  async fn chunked_response_is_reframed() {
    let response = parse(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-A: 1\r\n\r\n2\r\nok\r\n0\r\n\r\n",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(response.text(), "ok");
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("content-length: 2\r\n"));
    assert!(raw.contains("x-a: 1\r\n"));
    assert!(!raw.contains("transfer-encoding"));
    assert!(raw.ends_with("\r\n\r\nok"));
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let response = parse(
      b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n",
      Method::HEAD,
    )
    .await
    .unwrap();
    assert!(response.body().is_none());
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.contains("content-length: 42\r\n"), "HEAD keeps origin length");
  }

  #[tokio::test]
  async fn head_response_without_length_stays_bare() {
    let response = parse(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
      Method::HEAD,
    )
    .await
    .unwrap();
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert_eq!(raw, "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
    let response = parse(b"HTTP/1.1 200 OK\r\nServer: t\r\n\r\n", Method::HEAD)
      .await
      .unwrap();
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(!raw.contains("content-length"), "{raw}");
  }

  #[tokio::test]
  async fn interim_responses_are_skipped() {
    let response = parse(
      b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\n\
        HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
      Method::POST,
    )
    .await
    .unwrap();
    assert_eq!(response.status_code(), http::StatusCode::OK);
    assert_eq!(response.text(), "ok");
    assert!(!response.headers().contains_key("link"));
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{raw}");
  }

  #[tokio::test]
  async fn switching_protocols_is_final() {
    let response = parse(
      b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(response.status_code(), http::StatusCode::SWITCHING_PROTOCOLS);
    assert!(response.body().is_none());
  }

  struct Broken;

  impl AsyncRead for Broken {
    fn poll_read(
      self: std::pin::Pin<&mut Self>,
      _cx: &mut std::task::Context<'_>,
      _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
      std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
    }
  }

  #[tokio::test]
  async fn io_error_inside_headers_is_an_error() {
    let reader = (&b"HTTP/1.1 200 OK\r\nServer: t\r\n"[..]).chain(Broken);
    let result = ResponseBuilder::new(BufReader::new(reader), ResponseConfig::default())
      .build()
      .await;
    assert!(matches!(result, Err(Error::IO(_))));
  }

  #[tokio::test]
  async fn interim_response_without_final_is_an_error() {
    assert!(parse(b"HTTP/1.1 100 Continue\r\n\r\n", Method::GET).await.is_err());
  }

  #[tokio::test]
  async fn eof_delimited_body_and_custom_reason() {
    let response = parse(b"HTTP/1.0 404 Nope\r\nServer: t\r\n\r\nmissing", Method::GET)
      .await
      .unwrap();
    assert_eq!(response.status_code(), http::StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "missing");
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.0 404 Nope\r\n"));
    assert!(raw.contains("content-length: 7\r\n"));
  }

  #[tokio::test]
  async fn empty_stream_is_an_error() {
    assert!(parse(b"", Method::GET).await.is_err());
  }

  #[test]
  fn redirect_status_line_is_kept() {
    let mut response: Response = Response::builder()
      .status(302)
      .header("location", "/next")
      .body(Vec::new())
      .unwrap()
      .into();
    response
      .extensions_mut()
      .insert(ReasonPhrase(Bytes::from_static(b"Found")));
    let raw = String::from_utf8(response.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("HTTP/1.1 302 Found\r\nlocation: /next\r\n"));
  }

  #[test]
  fn error_response_is_plain_text() {
    let response = Response::error(http::StatusCode::BAD_REQUEST, "unsupported protocol: ftp");
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.text(), "unsupported protocol: ftp\n");
    assert!(response.allows_keep_alive());
  }
}
