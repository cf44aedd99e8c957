//! Wordlist path discovery against the origin of a captured request.
use std::path::Path;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::errors::{Error, Result};
use crate::{Client, Request};

/// The scan stops once this many paths answered with something other than `404`.
pub const MAX_FINDINGS: usize = 499;

/// A probed path that did not answer `404`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Finding {
  /// The probed URL.
  pub url: String,
  /// Status the origin answered with.
  pub status_code: u16,
  /// Response body, `None` when empty.
  pub body: Option<String>,
}

/// Probes wordlist paths on one origin with `GET` requests.
pub struct Scanner {
  client: Client,
  origin: String,
}

impl Scanner {
  /// Scan the origin (`scheme://authority`) of `url`.
  ///
  /// Path and query of `url` are ignored.
  pub fn new(client: Client, url: &str) -> Result<Scanner> {
    let uri: http::Uri = url
      .parse()
      .map_err(|e| Error::Other(format!("invalid url to scan {url}: {e}")))?;
    let origin = match (uri.scheme_str(), uri.authority()) {
      (Some(scheme), Some(authority)) => format!("{scheme}://{authority}"),
      _ => return Err(Error::Other(format!("invalid url to scan: {url}"))),
    };
    Ok(Scanner { client, origin })
  }

  /// The `scheme://authority` every path is appended to.
  pub fn origin(&self) -> &str {
    &self.origin
  }

  /// Probe every path in order, sequentially.
  ///
  /// Requests that fail outright are logged and skipped.
  pub async fn dirbust<I, S>(&self, paths: I) -> Vec<Finding>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut findings = Vec::new();
    for path in paths {
      if findings.len() >= MAX_FINDINGS {
        tracing::info!("stopping scan of {} after {} findings", self.origin, MAX_FINDINGS);
        break;
      }
      let url = format!("{}/{}", self.origin, path.as_ref().trim_start_matches('/'));
      let request: Request = match Request::builder().uri(url.as_str()).body(Vec::new()) {
        Ok(request) => request.into(),
        Err(err) => {
          tracing::warn!("skipping {}: {}", url, err);
          continue;
        }
      };
      let response = match self.client.execute(request).await {
        Ok(response) => response,
        Err(err) => {
          tracing::warn!("probe {} failed: {}", url, err);
          continue;
        }
      };
      let status = response.status_code();
      tracing::debug!("{} {}", url, status);
      if status == http::StatusCode::NOT_FOUND {
        continue;
      }
      let body = match response.body() {
        Some(b) if !b.is_empty() => Some(response.text()),
        _ => None,
      };
      findings.push(Finding {
        url,
        status_code: status.as_u16(),
        body,
      });
    }
    findings
  }
}

/// Read a wordlist, one path per line. Blank lines are skipped.
pub async fn load_wordlist<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
  let file = tokio::fs::File::open(path.as_ref()).await.map_err(|e| {
    Error::Other(format!(
      "failed to open wordlist {}: {e}",
      path.as_ref().display()
    ))
  })?;
  let mut lines = BufReader::new(file).lines();
  let mut words = Vec::new();
  while let Some(line) = lines.next_line().await? {
    let word = line.trim();
    if !word.is_empty() {
      words.push(word.to_string());
    }
  }
  Ok(words)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::redirect::Policy;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn client() -> Client {
    Client::builder()
      .native_roots(false)
      .redirect(Policy::none())
      .build()
      .unwrap()
  }

  // answers `/admin` with 200, `/empty` with 204 and everything else with 404
  async fn origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let (mut stream, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
          let mut buf = vec![0; 4096];
          let n = stream.read(&mut buf).await.unwrap();
          let head = String::from_utf8_lossy(&buf[..n]).to_string();
          let reply: &[u8] = if head.starts_with("GET /admin ") {
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nadmin"
          } else if head.starts_with("GET /empty ") {
            b"HTTP/1.1 204 No Content\r\n\r\n"
          } else {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"
          };
          stream.write_all(reply).await.unwrap();
        });
      }
    });
    addr
  }

  #[test]
  fn origin_drops_path_and_query() {
    let scanner = Scanner::new(client(), "http://example.com:8080/a/b?x=1").unwrap();
    assert_eq!(scanner.origin(), "http://example.com:8080");
    assert!(Scanner::new(client(), "/relative").is_err());
  }

  #[tokio::test]
  async fn reports_everything_but_404() {
    let addr = origin().await;
    let scanner = Scanner::new(client(), &format!("http://{addr}/login?next=1")).unwrap();
    let findings = scanner.dirbust(["missing", "/admin", "empty"]).await;
    assert_eq!(
      findings,
      vec![
        Finding {
          url: format!("http://{addr}/admin"),
          status_code: 200,
          body: Some("admin".to_string()),
        },
        Finding {
          url: format!("http://{addr}/empty"),
          status_code: 204,
          body: None,
        },
      ]
    );
  }

  #[tokio::test]
  async fn unreachable_paths_are_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let scanner = Scanner::new(client(), &format!("http://{addr}/")).unwrap();
    assert!(scanner.dirbust(["a", "b"]).await.is_empty());
  }

  #[tokio::test]
  async fn wordlist_skips_blank_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("words.txt");
    tokio::fs::write(&path, "admin\n\n  backup.zip \r\n.git/HEAD\n")
      .await
      .unwrap();
    assert_eq!(
      load_wordlist(&path).await.unwrap(),
      vec!["admin", "backup.zip", ".git/HEAD"]
    );
    assert!(load_wordlist(dir.path().join("none.txt")).await.is_err());
  }
}
