//! Plain HTTP relay: one absolute-form request in, one response out, both captured.
use std::sync::Arc;

use http::{HeaderValue, StatusCode};

use crate::capture::CaptureSink;
use crate::errors::Error;
use crate::{Client, Request, Response};

/// Forwards non-tunneled requests to their origin.
///
/// The client given to the relay should not follow redirects; a 3xx from the origin is
/// handed back to the proxy client as is.
pub struct PlainRelay {
  client: Client,
  sink: Arc<dyn CaptureSink>,
}

impl PlainRelay {
  /// Relay through `client`, capturing into `sink`.
  pub fn new(client: Client, sink: Arc<dyn CaptureSink>) -> PlainRelay {
    PlainRelay { client, sink }
  }

  /// Relay one request and produce the response to write back.
  ///
  /// Never fails: a non-`http` target becomes a `400`, an unreachable origin a `500`.
  /// Capture failures are logged and otherwise ignored.
  pub async fn relay(&self, mut request: Request) -> Response {
    let scheme = request.uri().scheme_str().unwrap_or_default().to_string();
    if scheme != "http" {
      let err = Error::UnsupportedScheme(scheme);
      tracing::warn!("rejecting {}: {}", request.uri(), err);
      return Response::error(err.status_code(), &err.to_string());
    }
    request.headers_mut().remove("proxy-connection");
    request
      .headers_mut()
      .insert(http::header::CONNECTION, HeaderValue::from_static("close"));

    let request_id = match self.sink.add_request(&request).await {
      Ok(id) => Some(id),
      Err(err) => {
        tracing::warn!("request capture failed: {}", err);
        None
      }
    };

    let uri = request.uri().clone();
    let response = match self.client.execute(request).await {
      Ok(response) => response,
      Err(err) => {
        tracing::error!(request_id, "upstream {} failed: {}", uri, err);
        return Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Server Error");
      }
    };
    tracing::info!(request_id, "{} {}", uri, response.status_code());

    if let Some(id) = request_id {
      if let Err(err) = self.sink.add_response(&response, id).await {
        tracing::warn!(request_id = id, "response capture failed: {}", err);
      }
    }
    response
  }
}
