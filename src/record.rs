//! Capture records: the shape requests and responses take once they leave the proxy engine.
use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::cookies;
use crate::errors::Result;
use crate::{Request, Response};

/// Header multimap keyed by lowercase header name, values in arrival order.
pub type HeaderRecord = BTreeMap<String, Vec<String>>;

/// Characters left alone when a query component is form-encoded.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'~')
  .remove(b' ');

/// One stored cookie.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
  /// name
  pub name: String,
  /// value
  pub value: String,
  /// Path attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// Domain attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
  /// Expires attribute as unix seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<i64>,
  /// Max-Age attribute in seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_age: Option<i64>,
  /// Secure flag
  #[serde(default)]
  pub secure: bool,
  /// HttpOnly flag
  #[serde(default)]
  pub http_only: bool,
  /// SameSite attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub same_site: Option<String>,
}

/// A captured request row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// identifier assigned by the sink, `0` before insertion
  pub id: i64,
  /// full request URL
  pub url: String,
  /// request method
  pub method: String,
  /// URL path, `None` when empty
  pub path: Option<String>,
  /// normalized query string, `None` when empty
  pub query: Option<String>,
  /// request headers
  pub headers: HeaderRecord,
  /// cookies sent by the client
  pub cookies: Vec<CookieRecord>,
  /// request body, `None` when empty
  pub body: Option<Vec<u8>>,
  /// linked response, once one was captured
  pub response_id: Option<i64>,
}

/// A captured response row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// identifier assigned by the sink, `0` before insertion
  pub id: i64,
  /// status code
  pub status_code: u16,
  /// response headers
  pub headers: HeaderRecord,
  /// cookies set by the origin
  pub cookies: Vec<CookieRecord>,
  /// response body, `None` when empty
  pub body: Option<Vec<u8>>,
}

impl From<&Request> for RequestRecord {
  fn from(value: &Request) -> Self {
    let uri = value.uri();
    let path = uri.path();
    RequestRecord {
      id: 0,
      url: uri.to_string(),
      method: value.method().to_string(),
      path: if path.is_empty() {
        None
      } else {
        Some(path.to_string())
      },
      query: uri.query().and_then(normalize_query),
      headers: header_record(value.headers()),
      cookies: cookies::extract_request_cookies(value.headers())
        .iter()
        .map(CookieRecord::from)
        .collect(),
      body: value
        .body()
        .filter(|b| !b.is_empty())
        .map(|b| b.to_vec()),
      response_id: None,
    }
  }
}

impl From<&Response> for ResponseRecord {
  fn from(value: &Response) -> Self {
    ResponseRecord {
      id: 0,
      status_code: value.status_code().as_u16(),
      headers: header_record(value.headers()),
      cookies: value.cookies().map(|c| CookieRecord::from(&c)).collect(),
      body: value
        .body()
        .as_ref()
        .filter(|b| !b.is_empty())
        .map(|b| b.to_vec()),
    }
  }
}

impl RequestRecord {
  /// Rebuild a request that can be sent again.
  ///
  /// Method, URL, headers and body are restored. Stored cookies are not put back into a
  /// `Cookie` header; only what the header record itself holds is sent.
  pub fn to_request(&self) -> Result<Request> {
    let mut builder = Request::builder()
      .method(self.method.as_str())
      .uri(self.url.as_str());
    if let Some(headers) = builder.headers_mut() {
      *headers = header_map(&self.headers)?;
    }
    let request = builder.body(self.body.clone().unwrap_or_default())?;
    Ok(request.into())
  }
}

/// Flatten a `HeaderMap` into its stored form.
pub fn header_record(headers: &http::HeaderMap) -> HeaderRecord {
  let mut record = HeaderRecord::new();
  for (k, v) in headers.iter() {
    record
      .entry(k.as_str().to_string())
      .or_default()
      .push(String::from_utf8_lossy(v.as_bytes()).to_string());
  }
  record
}

/// Inverse of [`header_record`].
pub fn header_map(record: &HeaderRecord) -> Result<http::HeaderMap> {
  let mut headers = http::HeaderMap::new();
  for (k, values) in record {
    let name = http::HeaderName::from_bytes(k.as_bytes())?;
    for v in values {
      headers.append(name.clone(), http::HeaderValue::from_str(v)?);
    }
  }
  Ok(headers)
}

/// Normalize a raw query string: decode it, sort by key and form-encode it again.
///
/// Values of a repeated key keep their order. Returns `None` for an empty query.
pub fn normalize_query(query: &str) -> Option<String> {
  let mut pairs: Vec<(String, String)> = query
    .split('&')
    .filter(|p| !p.is_empty())
    .map(|pair| match pair.split_once('=') {
      Some((k, v)) => (decode_component(k), decode_component(v)),
      None => (decode_component(pair), String::new()),
    })
    .collect();
  if pairs.is_empty() {
    return None;
  }
  pairs.sort_by(|a, b| a.0.cmp(&b.0));
  let encoded = pairs
    .iter()
    .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
    .collect::<Vec<_>>()
    .join("&");
  Some(encoded)
}

fn decode_component(s: &str) -> String {
  percent_decode_str(&s.replace('+', " "))
    .decode_utf8_lossy()
    .to_string()
}

fn encode_component(s: &str) -> String {
  utf8_percent_encode(s, QUERY_COMPONENT)
    .to_string()
    .replace(' ', "+")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn query_is_sorted_and_form_encoded() {
    assert_eq!(normalize_query("x=1").as_deref(), Some("x=1"));
    assert_eq!(
      normalize_query("b=2&a=hello%20world&a=%2F").as_deref(),
      Some("a=hello+world&a=%2F&b=2")
    );
    assert_eq!(normalize_query("flag").as_deref(), Some("flag="));
    assert_eq!(normalize_query(""), None);
  }

  #[test]
  fn request_record_keeps_multimap_and_nulls_empty_fields() {
    let request: Request = Request::builder()
      .method("GET")
      .uri("http://example.com/a?x=1")
      .header("Accept", "text/html")
      .header("X-Multi", "1")
      .header("X-Multi", "2")
      .header("Cookie", "sid=abc")
      .body(Vec::new())
      .unwrap()
      .into();
    let record = RequestRecord::from(&request);
    assert_eq!(record.url, "http://example.com/a?x=1");
    assert_eq!(record.method, "GET");
    assert_eq!(record.path.as_deref(), Some("/a"));
    assert_eq!(record.query.as_deref(), Some("x=1"));
    assert_eq!(record.headers["x-multi"], vec!["1", "2"]);
    assert_eq!(record.cookies[0].name, "sid");
    assert_eq!(record.body, None);
  }

  #[test]
  fn rebuilt_request_drops_cookie_list() {
    let record = RequestRecord {
      url: "http://example.com/p".into(),
      method: "POST".into(),
      headers: HeaderRecord::from([("x-a".to_string(), vec!["1".to_string()])]),
      cookies: vec![CookieRecord {
        name: "sid".into(),
        value: "abc".into(),
        ..Default::default()
      }],
      body: Some(b"data".to_vec()),
      ..Default::default()
    };
    let request = record.to_request().unwrap();
    assert_eq!(request.method(), &http::Method::POST);
    assert_eq!(request.headers()["x-a"], "1");
    assert!(request.headers().get(http::header::COOKIE).is_none());
    assert_eq!(request.body().unwrap().as_ref(), b"data");
  }
}
