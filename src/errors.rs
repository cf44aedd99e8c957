//! proxy engine error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `ballista::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while relaying, intercepting or capturing traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// capture storage error
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),
  /// header or cookie encoding error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// relay target is not plain http
  #[error("unsupported protocol: {0}")]
  UnsupportedScheme(String),
  /// malformed client input
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// certificate minting or loading failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// MITM handshake failed
  #[error("handshake error: {0}")]
  Handshake(String),
  /// connection cannot be taken over
  #[error("hijack error: {0}")]
  Hijack(String),
  /// origin unreachable or answered garbage
  #[error("upstream error: {0}")]
  Upstream(String),
  /// capture sink refused a write
  #[error("capture error: {0}")]
  Capture(String),
  /// configuration could not be loaded
  #[error("config error: {0}")]
  Config(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS handshake error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a capture error and log it
  pub fn capture_error(msg: impl Into<String>) -> Self {
    let error = Error::Capture(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a hijack error and log it
  pub fn hijack_error(msg: impl Into<String>) -> Self {
    let error = Error::Hijack(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream_error(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Status code used when this error still has to be answered on the wire.
  ///
  /// Client-input errors map to `400`, everything else to `500`.
  pub fn status_code(&self) -> http::StatusCode {
    match self {
      Error::UnsupportedScheme(_) | Error::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
      _ => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  /// `true` when the error was caused by what the client sent.
  pub fn is_client_error(&self) -> bool {
    self.status_code().is_client_error()
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUriParts> for Error {
  fn from(value: http::uri::InvalidUriParts) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}
