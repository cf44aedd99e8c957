//! Client-side connection handling and raw connection takeover.
use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{Error, Result};
use crate::request::RequestReader;
use crate::Response;

/// Writes responses back to the proxy client.
#[async_trait]
pub trait ResponseWriter {
  /// Stage a status line. Nothing is written until [`ResponseWriter::finish`], and a staged
  /// status is discarded when the connection is hijacked.
  fn write_header(&mut self, status: StatusCode);
  /// Write a complete response, replacing any staged status.
  async fn write_response(&mut self, response: &Response) -> Result<()>;
  /// Write a staged status as an empty response, if one is pending.
  async fn finish(&mut self) -> Result<()>;
}

/// Capability to detach the raw connection from the dispatcher.
pub trait Hijacker {
  /// The raw connection handed out by [`Hijacker::hijack`].
  type Conn: AsyncRead + AsyncWrite + Unpin + Send;
  /// `true` when [`Hijacker::hijack`] can succeed.
  fn can_hijack(&self) -> bool;
  /// Take exclusive ownership of the connection.
  fn hijack(self) -> Result<Self::Conn>;
}

/// An accepted client connection, as the dispatcher sees it.
///
/// Reads are buffered; bytes the client sent ahead of a hijack stay in the buffer and are
/// handed over with the connection.
pub struct Downstream<S> {
  reader: BufReader<S>,
  hijackable: bool,
  staged: Option<StatusCode>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Downstream<S> {
  /// Wrap an accepted connection.
  pub fn new(stream: S) -> Downstream<S> {
    Downstream {
      reader: BufReader::new(stream),
      hijackable: true,
      staged: None,
    }
  }

  /// Wrap a connection that must stay under dispatcher control.
  pub fn without_hijack(stream: S) -> Downstream<S> {
    Downstream {
      hijackable: false,
      ..Downstream::new(stream)
    }
  }

  /// Read the next request, `None` once the client closed the connection.
  pub async fn read_request(&mut self) -> Result<Option<crate::Request>> {
    RequestReader::new(&mut self.reader).read().await
  }

  /// Close the write side.
  pub async fn shutdown(&mut self) -> Result<()> {
    self.reader.get_mut().shutdown().await?;
    Ok(())
  }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ResponseWriter for Downstream<S> {
  fn write_header(&mut self, status: StatusCode) {
    self.staged = Some(status);
  }

  async fn write_response(&mut self, response: &Response) -> Result<()> {
    self.staged = None;
    let stream = self.reader.get_mut();
    stream.write_all(&response.to_raw()).await?;
    stream.flush().await?;
    Ok(())
  }

  async fn finish(&mut self) -> Result<()> {
    match self.staged.take() {
      Some(status) => {
        let response: Response = Response::builder().status(status).body(Vec::new())?.into();
        self.write_response(&response).await
      }
      None => Ok(()),
    }
  }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Hijacker for Downstream<S> {
  type Conn = BufReader<S>;

  fn can_hijack(&self) -> bool {
    self.hijackable
  }

  fn hijack(self) -> Result<Self::Conn> {
    if !self.hijackable {
      return Err(Error::hijack_error("connection does not support hijacking"));
    }
    if let Some(status) = self.staged {
      tracing::trace!("discarding staged {} on hijack", status);
    }
    Ok(self.reader)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn hijack_keeps_buffered_bytes_and_drops_staged_status() {
    let (mut client, server) = tokio::io::duplex(1024);
    client
      .write_all(b"CONNECT a.com:443 HTTP/1.1\r\nHost: a.com:443\r\n\r\nEARLY")
      .await
      .unwrap();
    let mut downstream = Downstream::new(server);
    let request = downstream.read_request().await.unwrap().unwrap();
    assert_eq!(request.method(), &http::Method::CONNECT);
    downstream.write_header(StatusCode::OK);
    assert!(downstream.can_hijack());
    let mut conn = downstream.hijack().unwrap();
    let mut early = [0; 5];
    conn.read_exact(&mut early).await.unwrap();
    assert_eq!(&early, b"EARLY");
    conn.write_all(b"raw").await.unwrap();
    drop(conn);
    let mut seen = Vec::new();
    client.read_to_end(&mut seen).await.unwrap();
    assert_eq!(seen, b"raw", "staged status must never reach the wire");
  }

  #[tokio::test]
  async fn non_hijackable_connection_refuses() {
    let (_client, server) = tokio::io::duplex(64);
    let downstream = Downstream::without_hijack(server);
    assert!(!downstream.can_hijack());
    assert!(downstream.hijack().is_err());
  }

  #[tokio::test]
  async fn finish_writes_staged_status() {
    let (mut client, server) = tokio::io::duplex(1024);
    let mut downstream = Downstream::without_hijack(server);
    downstream.write_header(StatusCode::OK);
    downstream.finish().await.unwrap();
    drop(downstream);
    let mut seen = String::new();
    client.read_to_string(&mut seen).await.unwrap();
    assert_eq!(seen, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
  }
}
