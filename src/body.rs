use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{new_io_error, Error, Result};

/// Upper bound for a buffered message body.
pub(crate) const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// A fully buffered message body.
///
/// Bodies are read completely before a message is forwarded so the same bytes can be
/// written upstream and handed to the capture sink. Cloning only bumps a reference count.
#[derive(Clone, PartialEq)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl From<Option<Vec<u8>>> for Body {
  #[inline]
  fn from(v: Option<Vec<u8>>) -> Body {
    match v {
      Some(vv) => Body { inner: vv.into() },
      None => Body {
        inner: Bytes::new(),
      },
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

/// `true` when the last transfer coding of the message is `chunked`.
pub(crate) fn is_chunked(headers: &http::HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    .unwrap_or(false)
}

pub(crate) fn content_length(headers: &http::HeaderMap) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => {
      let v = v
        .to_str()
        .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid content-length"))?;
      Ok(Some(v.trim().parse()?))
    }
  }
}

/// Read exactly `length` body bytes.
pub(crate) async fn read_sized<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  length: u64,
) -> Result<Vec<u8>> {
  if length > MAX_BODY_SIZE {
    return Err(Error::invalid_request(format!("body of {length} bytes is too large")));
  }
  let mut body = Vec::new();
  let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
  if (read as u64) < length {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "body shorter than content-length",
    ));
  }
  Ok(body)
}

/// Decode a chunked body, consuming the trailer section.
pub(crate) async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "eof inside chunked body",
      ));
    }
    let size_line = trim_line(&line);
    // chunk extensions are ignored
    let size = size_line
      .split(|b| *b == b';')
      .next()
      .map(|s| String::from_utf8_lossy(s).trim().to_string())
      .unwrap_or_default();
    let size = u64::from_str_radix(&size, 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {size}")))?;
    if size == 0 {
      break;
    }
    if size > MAX_BODY_SIZE - body.len() as u64 {
      return Err(Error::invalid_request("chunked body is too large"));
    }
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) < size {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "eof inside chunk",
      ));
    }
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
  }
  // trailers
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || trim_line(&line).is_empty() {
      break;
    }
  }
  Ok(body)
}

pub(crate) fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn decodes_chunked_with_extensions_and_trailers() {
    let raw: &[u8] = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\nNEXT";
    let mut reader = tokio::io::BufReader::new(raw);
    let body = read_chunked(&mut reader).await.unwrap();
    assert_eq!(body, b"Wikipedia");
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"NEXT", "trailers must be consumed, nothing more");
  }

  #[tokio::test]
  async fn short_sized_body_is_an_error() {
    let raw: &[u8] = b"abc";
    let mut reader = tokio::io::BufReader::new(raw);
    assert!(read_sized(&mut reader, 10).await.is_err());
  }

  #[tokio::test]
  async fn huge_chunk_size_is_rejected() {
    let raw: &[u8] = b"ffffffffffffffff\r\n";
    let mut reader = tokio::io::BufReader::new(raw);
    let err = read_chunked(&mut reader).await.unwrap_err();
    assert!(err.is_client_error(), "{err}");
  }

  #[tokio::test]
  async fn chunks_past_the_body_cap_are_rejected() {
    let raw = format!("{:x}\r\nab\r\n", MAX_BODY_SIZE + 1);
    let mut reader = tokio::io::BufReader::new(raw.as_bytes());
    assert!(read_chunked(&mut reader).await.unwrap_err().is_client_error());
    let mut reader = tokio::io::BufReader::new(&b""[..]);
    assert!(read_sized(&mut reader, MAX_BODY_SIZE + 1)
      .await
      .unwrap_err()
      .is_client_error());
  }

  #[tokio::test]
  async fn truncated_chunk_is_an_error() {
    let raw: &[u8] = b"a\r\nabc";
    let mut reader = tokio::io::BufReader::new(raw);
    let err = read_chunked(&mut reader).await.unwrap_err();
    assert!(!err.is_client_error());
  }

  #[test]
  fn chunked_detection_uses_last_coding() {
    let mut headers = http::HeaderMap::new();
    headers.insert(
      http::header::TRANSFER_ENCODING,
      http::HeaderValue::from_static("gzip, Chunked"),
    );
    assert!(is_chunked(&headers));
    headers.insert(
      http::header::TRANSFER_ENCODING,
      http::HeaderValue::from_static("chunked, gzip"),
    );
    assert!(!is_chunked(&headers));
  }
}
