use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{self, Body};
use crate::errors::{new_io_error, Error, Result};
use crate::response::{parser_headers, parser_version};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Upper bound for a request line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// One HTTP request, with its body fully buffered.
#[derive(Default, Clone, PartialEq)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize the request for the next hop.
  ///
  /// The request target is always written in origin-form from the current `uri`, so a
  /// request read in absolute-form or rewritten by the tunnel goes out correctly. A buffered
  /// body is re-framed with `Content-Length`; any `Transfer-Encoding` is dropped.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(authority.as_str().as_bytes());
      }
    } else {
      let path = self.uri.path();
      let path = if path.is_empty() { "/" } else { path };
      http_requests.extend(path.as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend(b"?");
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    // Host goes first when the client did not send one
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(s) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(s.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    match self.body() {
      Some(b) if !b.is_empty() => {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
      }
      _ => {
        if body::is_chunked(&self.headers) {
          headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(0));
        }
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  ///
  /// # Examples
  ///
  /// ```
  /// let request: ballista::Request = ballista::Request::builder()
  ///     .method("GET")
  ///     .uri("http://example.com/a?x=1")
  ///     .header("X-Custom-Foo", "Bar")
  ///     .body(Vec::new())
  ///     .unwrap()
  ///     .into();
  /// assert_eq!(request.uri().path(), "/a");
  /// ```
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// The HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The request target as parsed from the request line.
  ///
  /// Absolute-form (`http://host/path`) for plain proxy requests, origin-form (`/path`)
  /// inside an intercepted tunnel, authority-form (`host:443`) for `CONNECT`.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Mutable access to the request target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// The request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The buffered body, if the request carried one.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Mutable access to the buffered body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
  /// Whether the client asked to keep its connection open after this exchange.
  pub fn wants_keep_alive(&self) -> bool {
    connection_allows_keep_alive(&self.headers, self.version)
  }
}

pub(crate) fn connection_allows_keep_alive(headers: &HeaderMap, version: Version) -> bool {
  let mut tokens = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase());
  match version {
    Version::HTTP_11 => !tokens.any(|t| t == "close"),
    Version::HTTP_10 => tokens.any(|t| t == "keep-alive"),
    _ => false,
  }
}

/// Reads HTTP/1.x requests off a buffered stream.
///
/// A clean end of stream before the first byte of a request is reported as `Ok(None)`,
/// which is how a peer closing an idle connection shows up. End of stream anywhere inside
/// a request is an error.
pub struct RequestReader<'a, R> {
  reader: &'a mut R,
}

impl<'a, R: AsyncBufRead + Unpin> RequestReader<'a, R> {
  /// Reader over a buffered client stream.
  pub fn new(reader: &'a mut R) -> Self {
    RequestReader { reader }
  }

  async fn read_line(&mut self, line: &mut Vec<u8>, used: &mut usize) -> Result<usize> {
    line.clear();
    let n = self.reader.read_until(b'\n', line).await?;
    *used += n;
    if *used > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("request head too large"));
    }
    Ok(n)
  }

  /// Read the next complete request.
  pub async fn read(mut self) -> Result<Option<Request>> {
    let mut used = 0;
    let mut line = Vec::new();
    // tolerate empty lines between requests
    loop {
      if self.read_line(&mut line, &mut used).await? == 0 {
        return Ok(None);
      }
      if !body::trim_line(&line).is_empty() {
        break;
      }
    }
    let request_line = body::trim_line(&line).to_vec();
    let mut parts = request_line.splitn(3, |b| *b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
      _ => {
        return Err(Error::invalid_request(format!(
          "malformed request line: {}",
          request_line.escape_ascii()
        )))
      }
    };
    let method = Method::from_bytes(method)
      .map_err(|_| Error::invalid_request(format!("invalid method: {}", method.escape_ascii())))?;
    let uri = http::Uri::try_from(target)
      .map_err(|e| Error::invalid_request(format!("invalid request target: {e}")))?;
    let version = parser_version(version)?;
    let mut headers = HeaderMap::new();
    loop {
      if self.read_line(&mut line, &mut used).await? == 0 {
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "eof inside request head",
        ));
      }
      let header_line = body::trim_line(&line);
      if header_line.is_empty() {
        break;
      }
      match parser_headers(header_line) {
        Ok((Some(k), Some(v))) => {
          headers.append(k, v);
        }
        _ => {
          return Err(Error::invalid_request(format!(
            "malformed header line: {}",
            header_line.escape_ascii()
          )))
        }
      }
    }
    let body = if body::is_chunked(&headers) {
      body::read_chunked(&mut *self.reader).await?
    } else if let Some(length) = body::content_length(&headers)? {
      body::read_sized(&mut *self.reader, length).await?
    } else {
      Vec::new()
    };
    let mut request: Request = Request::builder()
      .method(method)
      .uri(uri)
      .version(version)
      .body(body)?
      .into();
    *request.headers_mut() = headers;
    Ok(Some(request))
  }
}
