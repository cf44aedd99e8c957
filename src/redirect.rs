use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::HeaderMap;
/// A type that controls the policy on how to handle the following of redirects.
///
/// The default value has a maximum of 10 redirects it will follow in a chain.
/// The proxy paths never follow redirects, they hand every 3xx back to the client.
///
/// - `limited` can be used have the same as the default behavior, but adjust
///   the allowed maximum redirect hops in a chain.
/// - `none` can be used to disable all redirect behavior.
#[derive(Clone, Debug, PartialEq)]
pub enum Policy {
  /// - `limited` can be used have the same as the default behavior, but adjust
  Limit(usize),
  /// - `none` can be used to disable all redirect behavior.
  None,
}

/// An action to perform when a redirect status code is found.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Action {
  Follow,
  Stop,
}

impl Policy {
  /// Create a `Policy` with a maximum number of redirects.
  ///
  /// Once the max is reached the last 3xx response is returned as is.
  pub fn limited(max: usize) -> Self {
    Policy::Limit(max)
  }
  /// Create a `Policy` that does not follow any redirect.
  pub fn none() -> Self {
    Policy::None
  }

  pub(crate) fn check(&self, previous: &[http::Uri]) -> Action {
    match self {
      Policy::Limit(max) if previous.len() <= *max => Action::Follow,
      _ => Action::Stop,
    }
  }
}

impl Default for Policy {
  fn default() -> Policy {
    Policy::limited(10)
  }
}

pub(crate) fn remove_sensitive_headers(
  headers: &mut HeaderMap,
  next: &http::Uri,
  previous: &[http::Uri],
) {
  if let Some(previous) = previous.last() {
    let cross_host = next.host() != previous.host() || next.port_u16() != previous.port_u16();
    if cross_host {
      headers.remove(AUTHORIZATION);
      headers.remove(COOKIE);
      headers.remove("cookie2");
      headers.remove(PROXY_AUTHORIZATION);
      headers.remove(WWW_AUTHENTICATE);
    }
  }
}

/// Resolve a `Location` header value against the URI that produced it.
pub(crate) fn resolve_location(base: &http::Uri, location: &str) -> Option<http::Uri> {
  let location = location.trim();
  if location.is_empty() {
    return None;
  }
  if let Ok(uri) = location.parse::<http::Uri>() {
    if uri.scheme().is_some() && uri.authority().is_some() {
      return Some(uri);
    }
  }
  let scheme = base.scheme_str().unwrap_or("http");
  if let Some(rest) = location.strip_prefix("//") {
    return format!("{scheme}://{rest}").parse().ok();
  }
  let authority = base.authority()?.as_str();
  let path = if location.starts_with('/') {
    location.to_string()
  } else {
    let dir = match base.path().rfind('/') {
      Some(i) => &base.path()[..=i],
      None => "/",
    };
    format!("{dir}{location}")
  };
  format!("{scheme}://{authority}{path}").parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn none_never_follows() {
    let next: http::Uri = "http://a/next".parse().unwrap();
    assert_eq!(Policy::none().check(&[next]), Action::Stop);
    assert_eq!(Policy::none().check(&[]), Action::Stop);
  }

  #[test]
  fn limit_counts_previous_hops() {
    let next: http::Uri = "http://a/next".parse().unwrap();
    let previous = vec![next.clone(); 2];
    assert_eq!(Policy::limited(2).check(&previous), Action::Follow);
    let previous = vec![next; 3];
    assert_eq!(Policy::limited(2).check(&previous), Action::Stop);
  }

  #[test]
  fn location_resolution() {
    let base: http::Uri = "https://example.com/a/b?x=1".parse().unwrap();
    assert_eq!(
      resolve_location(&base, "/root").unwrap(),
      "https://example.com/root"
    );
    assert_eq!(
      resolve_location(&base, "c").unwrap(),
      "https://example.com/a/c"
    );
    assert_eq!(
      resolve_location(&base, "//other.org/p").unwrap(),
      "https://other.org/p"
    );
    assert_eq!(
      resolve_location(&base, "http://plain.org/").unwrap(),
      "http://plain.org/"
    );
    assert!(resolve_location(&base, "").is_none());
  }

  #[test]
  fn cross_host_drops_credentials() {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, "Basic x".parse().unwrap());
    headers.insert(COOKIE, "a=1".parse().unwrap());
    let previous: Vec<http::Uri> = vec!["http://a.com/".parse().unwrap()];
    remove_sensitive_headers(&mut headers, &"http://a.com/x".parse().unwrap(), &previous);
    assert!(headers.contains_key(AUTHORIZATION));
    remove_sensitive_headers(&mut headers, &"http://b.com/".parse().unwrap(), &previous);
    assert!(headers.is_empty());
  }
}
