//! Capture sink: where relayed traffic is recorded.
//!
//! The proxy engine only ever calls [`CaptureSink::add_request`] and
//! [`CaptureSink::add_response`]; the read side exists for replay and for tooling built on the
//! captured data.
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::{Error, Result};
use crate::record::{CookieRecord, HeaderRecord, RequestRecord, ResponseRecord};
use crate::{Request, Response};

/// Persistence contract for captured requests and responses.
///
/// Implementations must tolerate concurrent calls from every connection worker.
#[async_trait]
pub trait CaptureSink: Send + Sync {
  /// Store a request and return its new identifier.
  async fn add_request(&self, request: &Request) -> Result<i64>;
  /// Store a response and link it onto the request `request_id`.
  ///
  /// Either both happen or neither does.
  async fn add_response(&self, response: &Response, request_id: i64) -> Result<i64>;
  /// Rebuild a stored request for replay.
  async fn get_request(&self, id: i64) -> Result<Option<Request>>;
  /// The full URL of a stored request.
  async fn get_request_url(&self, id: i64) -> Result<Option<String>>;
  /// A stored request record, including its response link.
  async fn get_request_record(&self, id: i64) -> Result<Option<RequestRecord>>;
  /// A stored response record.
  async fn get_response(&self, id: i64) -> Result<Option<ResponseRecord>>;
  /// The response linked to a request, if one was captured.
  async fn get_response_by_request_id(&self, request_id: i64) -> Result<Option<ResponseRecord>>;
  /// Every stored request, oldest first.
  async fn list_requests(&self) -> Result<Vec<RequestRecord>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL,
  method TEXT NOT NULL,
  path TEXT,
  query_param TEXT,
  header TEXT,
  cookie TEXT,
  body BLOB,
  response_id INTEGER
);
CREATE TABLE IF NOT EXISTS response (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  status_code INTEGER NOT NULL,
  header TEXT,
  cookie TEXT,
  body BLOB
);
";

const REQUEST_COLUMNS: &str =
  "id, url, method, path, query_param, header, cookie, body, response_id";
const RESPONSE_COLUMNS: &str = "id, status_code, header, cookie, body";

/// SQLite backed [`CaptureSink`].
///
/// Every statement runs on the blocking pool, one at a time over a single connection.
pub struct SqliteSink {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
  /// Open or create the database at `path`.
  pub fn open<P: AsRef<Path>>(path: P) -> Result<SqliteSink> {
    let conn = Connection::open(path.as_ref())?;
    tracing::info!("capture database at {}", path.as_ref().display());
    Self::init(conn)
  }

  /// A private in-memory database.
  pub fn in_memory() -> Result<SqliteSink> {
    Self::init(Connection::open_in_memory()?)
  }

  fn init(conn: Connection) -> Result<SqliteSink> {
    conn.execute_batch(SCHEMA)?;
    Ok(SqliteSink {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|_| Error::capture_error("capture database lock poisoned"))?;
      f(&mut *conn)
    })
    .await
    .map_err(|e| Error::capture_error(format!("capture task failed: {e}")))?
  }
}

fn headers_json(headers: &HeaderRecord) -> Result<Option<String>> {
  if headers.is_empty() {
    return Ok(None);
  }
  Ok(Some(serde_json::to_string(headers)?))
}

fn cookies_json(cookies: &[CookieRecord]) -> Result<Option<String>> {
  if cookies.is_empty() {
    return Ok(None);
  }
  Ok(Some(serde_json::to_string(cookies)?))
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> Result<T> {
  match raw {
    Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
    _ => Ok(T::default()),
  }
}

// raw columns; JSON decoding happens outside the rusqlite row mapper
type RequestRow = (
  i64,
  String,
  String,
  Option<String>,
  Option<String>,
  Option<String>,
  Option<String>,
  Option<Vec<u8>>,
  Option<i64>,
);
type ResponseRow = (i64, u16, Option<String>, Option<String>, Option<Vec<u8>>);

fn request_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
  ))
}

fn response_row(row: &Row<'_>) -> rusqlite::Result<ResponseRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn request_record(row: RequestRow) -> Result<RequestRecord> {
  let (id, url, method, path, query, header, cookie, body, response_id) = row;
  Ok(RequestRecord {
    id,
    url,
    method,
    path,
    query,
    headers: from_json(header)?,
    cookies: from_json(cookie)?,
    body,
    response_id,
  })
}

fn response_record(row: ResponseRow) -> Result<ResponseRecord> {
  let (id, status_code, header, cookie, body) = row;
  Ok(ResponseRecord {
    id,
    status_code,
    headers: from_json(header)?,
    cookies: from_json(cookie)?,
    body,
  })
}

#[async_trait]
impl CaptureSink for SqliteSink {
  async fn add_request(&self, request: &Request) -> Result<i64> {
    let record = RequestRecord::from(request);
    let header = headers_json(&record.headers)?;
    let cookie = cookies_json(&record.cookies)?;
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO request (url, method, path, query_param, header, cookie, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          params![
            record.url,
            record.method,
            record.path,
            record.query,
            header,
            cookie,
            record.body
          ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(request_id = id, "captured request {} {}", record.method, record.url);
        Ok(id)
      })
      .await
  }

  async fn add_response(&self, response: &Response, request_id: i64) -> Result<i64> {
    let record = ResponseRecord::from(response);
    let header = headers_json(&record.headers)?;
    let cookie = cookies_json(&record.cookies)?;
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO response (status_code, header, cookie, body) VALUES (?1, ?2, ?3, ?4)",
          params![record.status_code, header, cookie, record.body],
        )?;
        let id = tx.last_insert_rowid();
        let linked = tx.execute(
          "UPDATE request SET response_id = ?1 WHERE id = ?2",
          params![id, request_id],
        )?;
        if linked == 0 {
          // dropping the transaction rolls the insert back
          return Err(Error::capture_error(format!(
            "no request {request_id} to link response to"
          )));
        }
        tx.commit()?;
        tracing::debug!(request_id, response_id = id, "captured response {}", record.status_code);
        Ok(id)
      })
      .await
  }

  async fn get_request(&self, id: i64) -> Result<Option<Request>> {
    match self.get_request_record(id).await? {
      Some(record) => Ok(Some(record.to_request()?)),
      None => Ok(None),
    }
  }

  async fn get_request_url(&self, id: i64) -> Result<Option<String>> {
    self
      .with_conn(move |conn| {
        let url = conn
          .query_row("SELECT url FROM request WHERE id = ?1", params![id], |row| {
            row.get(0)
          })
          .optional()?;
        Ok(url)
      })
      .await
  }

  async fn get_request_record(&self, id: i64) -> Result<Option<RequestRecord>> {
    let row = self
      .with_conn(move |conn| {
        let row = conn
          .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM request WHERE id = ?1"),
            params![id],
            request_row,
          )
          .optional()?;
        Ok(row)
      })
      .await?;
    row.map(request_record).transpose()
  }

  async fn get_response(&self, id: i64) -> Result<Option<ResponseRecord>> {
    let row = self
      .with_conn(move |conn| {
        let row = conn
          .query_row(
            &format!("SELECT {RESPONSE_COLUMNS} FROM response WHERE id = ?1"),
            params![id],
            response_row,
          )
          .optional()?;
        Ok(row)
      })
      .await?;
    row.map(response_record).transpose()
  }

  async fn get_response_by_request_id(&self, request_id: i64) -> Result<Option<ResponseRecord>> {
    let response_id: Option<Option<i64>> = self
      .with_conn(move |conn| {
        let id = conn
          .query_row(
            "SELECT response_id FROM request WHERE id = ?1",
            params![request_id],
            |row| row.get(0),
          )
          .optional()?;
        Ok(id)
      })
      .await?;
    match response_id.flatten() {
      Some(id) => self.get_response(id).await,
      None => Ok(None),
    }
  }

  async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
    let rows = self
      .with_conn(|conn| {
        let mut stmt =
          conn.prepare(&format!("SELECT {REQUEST_COLUMNS} FROM request ORDER BY id"))?;
        let rows = stmt
          .query_map([], request_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    rows.into_iter().map(request_record).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request() -> Request {
    Request::builder()
      .method("GET")
      .uri("http://example.com/a?x=1")
      .header("Host", "example.com")
      .header("Cookie", "sid=abc")
      .body(Vec::new())
      .unwrap()
      .into()
  }

  fn response() -> Response {
    Response::builder()
      .status(200)
      .header("Set-Cookie", "token=1; HttpOnly")
      .body("ok")
      .unwrap()
      .into()
  }

  #[tokio::test]
  async fn request_and_response_are_linked() {
    let sink = SqliteSink::in_memory().unwrap();
    let req_id = sink.add_request(&request()).await.unwrap();
    let resp_id = sink.add_response(&response(), req_id).await.unwrap();

    let record = sink.get_request_record(req_id).await.unwrap().unwrap();
    assert_eq!(record.method, "GET");
    assert_eq!(record.path.as_deref(), Some("/a"));
    assert_eq!(record.query.as_deref(), Some("x=1"));
    assert_eq!(record.body, None);
    assert_eq!(record.response_id, Some(resp_id));
    assert_eq!(record.cookies[0].name, "sid");

    let linked = sink.get_response_by_request_id(req_id).await.unwrap().unwrap();
    assert_eq!(linked.id, resp_id);
    assert_eq!(linked.status_code, 200);
    assert_eq!(linked.body.as_deref(), Some(&b"ok"[..]));
    assert!(linked.cookies[0].http_only);
  }

  #[tokio::test]
  async fn link_failure_rolls_back_response() {
    let sink = SqliteSink::in_memory().unwrap();
    assert!(sink.add_response(&response(), 42).await.is_err());
    assert!(sink.get_response(1).await.unwrap().is_none(), "insert must be rolled back");
  }

  #[tokio::test]
  async fn missing_rows_are_none() {
    let sink = SqliteSink::in_memory().unwrap();
    assert_eq!(sink.get_request_url(7).await.unwrap(), None);
    assert!(sink.get_request(7).await.unwrap().is_none());
    assert!(sink.get_response_by_request_id(7).await.unwrap().is_none());
    assert!(sink.list_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn request_without_response_has_no_link() {
    let sink = SqliteSink::in_memory().unwrap();
    let id = sink.add_request(&request()).await.unwrap();
    assert_eq!(
      sink.get_request_url(id).await.unwrap().as_deref(),
      Some("http://example.com/a?x=1")
    );
    assert!(sink.get_response_by_request_id(id).await.unwrap().is_none());
    let replay = sink.get_request(id).await.unwrap().unwrap();
    assert_eq!(replay.uri(), "http://example.com/a?x=1");
    assert_eq!(replay.headers()["cookie"], "sid=abc");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn concurrent_writers_get_distinct_ids() {
    let sink = Arc::new(SqliteSink::in_memory().unwrap());
    let mut tasks = Vec::new();
    for _ in 0..16 {
      let sink = sink.clone();
      tasks.push(tokio::spawn(async move {
        let id = sink.add_request(&request()).await.unwrap();
        sink.add_response(&response(), id).await.unwrap();
        id
      }));
    }
    let mut ids = Vec::new();
    for task in tasks {
      ids.push(task.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    let records = sink.list_requests().await.unwrap();
    assert!(records.iter().all(|r| r.response_id.is_some()));
  }

  #[tokio::test]
  async fn file_database_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.db");
    {
      let sink = SqliteSink::open(&path).unwrap();
      sink.add_request(&request()).await.unwrap();
    }
    let sink = SqliteSink::open(&path).unwrap();
    assert_eq!(sink.list_requests().await.unwrap().len(), 1);
  }
}
