//! The wire seam: one HTTP exchange with no retry, refresh or breaker logic.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, COOKIE};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;

/// Header carrying the per-request correlation id.
pub const CORRELATION_HEADER: &str = "X-Request-ID";

/// Cookie name for the session credential used by the refresh handshake.
pub const SESSION_COOKIE: &str = "refreshToken";

/// Failure text when the backend sends no message of its own.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred";

/// A fully resolved request as it goes on the wire.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub bearer: Option<String>,
  pub session_token: Option<String>,
  pub correlation_id: String,
}

/// Any response that arrived, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Value,
}

impl HttpResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Human-readable failure text, preferring the backend's own message.
  pub fn error_message(&self) -> String {
    self
      .body
      .get("message")
      .or_else(|| self.body.get("error"))
      .and_then(|v| v.as_str())
      .map(String::from)
      .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_string())
  }

  pub fn into_error(self) -> TransportError {
    TransportError::Http {
      status: self.status,
      message: self.error_message(),
    }
  }
}

/// Performs one HTTP exchange.
///
/// Implementations return `Err` only when no response was received
/// (`Network` or `Timeout`); every status code is an `Ok` response.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn execute(&self, request: OutgoingRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed implementation.
#[derive(Clone)]
pub struct ReqwestBackend {
  client: reqwest::Client,
  base_url: String,
}

impl ReqwestBackend {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
    // Validate early so a bad config fails at startup, not per request
    url::Url::parse(base_url).map_err(|e| TransportError::Network(e.to_string()))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Network(e.to_string()))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
    })
  }

  fn url_for(&self, path: &str) -> Result<url::Url, TransportError> {
    let joined = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
    url::Url::parse(&joined).map_err(|e| TransportError::Network(e.to_string()))
  }
}

#[async_trait]
impl Backend for ReqwestBackend {
  async fn execute(&self, request: OutgoingRequest) -> Result<HttpResponse, TransportError> {
    let url = self.url_for(&request.path)?;

    let mut builder = self
      .client
      .request(request.method.clone(), url)
      .header(CORRELATION_HEADER, &request.correlation_id)
      .header(reqwest::header::ACCEPT, "application/json");

    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(token) = &request.bearer {
      builder = builder.bearer_auth(token);
    }
    if let Some(session) = &request.session_token {
      let cookie = HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, session))
        .map_err(|e| TransportError::Network(e.to_string()))?;
      builder = builder.header(COOKIE, cookie);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(classify)?;

    debug!(status, len = bytes.len(), "Response received");

    Ok(HttpResponse::new(status, parse_body(&bytes)))
  }
}

fn classify(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Network(e.to_string())
  }
}

/// Empty bodies become null; non-JSON bodies are kept as a string.
fn parse_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn outgoing(method: Method, path: &str) -> OutgoingRequest {
    OutgoingRequest {
      method,
      path: path.to_string(),
      query: Vec::new(),
      body: None,
      bearer: None,
      session_token: None,
      correlation_id: "corr-1".to_string(),
    }
  }

  #[tokio::test]
  async fn test_reqwest_backend_sends_headers_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/yeets"))
      .and(query_param("page", "2"))
      .and(header("authorization", "Bearer tok"))
      .and(header(CORRELATION_HEADER, "corr-1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "1"}])))
      .expect(1)
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let mut request = outgoing(Method::GET, "/yeets");
    request.query.push(("page".into(), "2".into()));
    request.bearer = Some("tok".into());

    let response = backend.execute(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!([{"id": "1"}]));
  }

  #[tokio::test]
  async fn test_reqwest_backend_returns_error_statuses_as_responses() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/yeets/9"))
      .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "gone"})))
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let response = backend
      .execute(outgoing(Method::DELETE, "yeets/9"))
      .await
      .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(
      response.into_error(),
      TransportError::Http {
        status: 404,
        message: "gone".into()
      }
    );
  }

  #[tokio::test]
  async fn test_reqwest_backend_session_cookie() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/auth/refresh"))
      .and(header("cookie", "refreshToken=sess"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "n"})))
      .expect(1)
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let mut request = outgoing(Method::GET, "/auth/refresh");
    request.session_token = Some("sess".into());
    let response = backend.execute(request).await.unwrap();
    assert!(response.is_success());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    // Port 9 (discard) is closed on test hosts
    let backend = ReqwestBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let result = backend.execute(outgoing(Method::GET, "/yeets")).await;
    assert!(result.unwrap_err().is_network_level());
  }

  #[test]
  fn test_parse_body_variants() {
    assert_eq!(parse_body(b""), Value::Null);
    assert_eq!(parse_body(b"{\"a\":1}"), json!({"a": 1}));
    assert_eq!(parse_body(b"oops"), json!("oops"));
  }
}
