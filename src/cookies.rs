//! Cookie extraction for captured messages.
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderValue;
use std::fmt::Debug;
use std::time::SystemTime;

use crate::record::CookieRecord;

/// A parsed cookie, either from a request `Cookie` header or a response `Set-Cookie` header.
#[derive(Debug, Clone)]
pub struct Cookie<'a>(cookie::Cookie<'a>);

impl<'a> Cookie<'a> {
  fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, cookie::ParseError> {
    std::str::from_utf8(value.as_bytes())
      .map_err(cookie::ParseError::from)
      .and_then(cookie::Cookie::parse)
      .map(Cookie)
  }

  pub fn name(&self) -> &str {
    self.0.name()
  }

  pub fn value(&self) -> &str {
    self.0.value()
  }

  pub fn http_only(&self) -> bool {
    self.0.http_only().unwrap_or(false)
  }

  pub fn secure(&self) -> bool {
    self.0.secure().unwrap_or(false)
  }

  pub fn path(&self) -> Option<&str> {
    self.0.path()
  }

  pub fn domain(&self) -> Option<&str> {
    self.0.domain()
  }

  /// `Max-Age` in whole seconds.
  pub fn max_age(&self) -> Option<i64> {
    self.0.max_age().map(|d| d.whole_seconds())
  }

  pub fn expires(&self) -> Option<SystemTime> {
    match self.0.expires() {
      Some(cookie::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
      None | Some(cookie::Expiration::Session) => None,
    }
  }

  pub fn same_site(&self) -> Option<String> {
    self.0.same_site().map(|s| s.to_string())
  }
}

impl From<&Cookie<'_>> for CookieRecord {
  fn from(c: &Cookie<'_>) -> Self {
    CookieRecord {
      name: c.name().to_string(),
      value: c.value().to_string(),
      path: c.path().map(str::to_string),
      domain: c.domain().map(str::to_string),
      expires: c.expires().and_then(|t| {
        t.duration_since(SystemTime::UNIX_EPOCH)
          .ok()
          .map(|d| d.as_secs() as i64)
      }),
      max_age: c.max_age(),
      secure: c.secure(),
      http_only: c.http_only(),
      same_site: c.same_site(),
    }
  }
}

pub(crate) fn extract_response_cookies(
  headers: &http::HeaderMap,
) -> impl Iterator<Item = Result<Cookie<'_>, cookie::ParseError>> {
  headers.get_all(SET_COOKIE).iter().map(Cookie::parse)
}

/// Cookies sent by the client, one entry per `name=value` pair of every `Cookie` header.
pub(crate) fn extract_request_cookies(headers: &http::HeaderMap) -> Vec<Cookie<'_>> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(cookie::Cookie::split_parse)
    .filter_map(|c| c.ok())
    .map(Cookie)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_request_cookie_header() {
    let mut headers = http::HeaderMap::new();
    headers.append(COOKIE, HeaderValue::from_static("a=1; b=two"));
    headers.append(COOKIE, HeaderValue::from_static("c=3"));
    let names: Vec<_> = extract_request_cookies(&headers)
      .iter()
      .map(|c| format!("{}={}", c.name(), c.value()))
      .collect();
    assert_eq!(names, vec!["a=1", "b=two", "c=3"]);
  }

  #[test]
  fn set_cookie_attributes_survive_into_record() {
    let mut headers = http::HeaderMap::new();
    headers.append(
      SET_COOKIE,
      HeaderValue::from_static("sid=abc; Path=/; Max-Age=60; Secure; HttpOnly; SameSite=Lax"),
    );
    let cookies: Vec<_> = extract_response_cookies(&headers)
      .filter_map(|c| c.ok())
      .collect();
    let record = CookieRecord::from(&cookies[0]);
    assert_eq!(record.name, "sid");
    assert_eq!(record.path.as_deref(), Some("/"));
    assert_eq!(record.max_age, Some(60));
    assert!(record.secure && record.http_only);
    assert_eq!(record.same_site.as_deref(), Some("Lax"));
  }
}
