//! HTTP transport with auth injection, circuit breaking, 5xx retry and
//! single-flight token refresh.

mod backend;
mod breaker;
mod request;

pub use backend::{
  Backend, HttpResponse, OutgoingRequest, ReqwestBackend, CORRELATION_HEADER,
  GENERIC_ERROR_MESSAGE, SESSION_COOKIE,
};
pub use breaker::{CircuitBreaker, CircuitState, Permit, Trip};
pub use request::{ApiRequest, RequestTag};

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::envelope;
use crate::error::TransportError;
use crate::notice::{Notice, NoticeSink};
use crate::session::Session;

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Request sender shared by every fetcher and mutation. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
  backend: Arc<dyn Backend>,
  session: Arc<Session>,
  breaker: Arc<CircuitBreaker>,
  notices: NoticeSink,
  max_retries: u32,
  backoff_unit: Duration,
}

impl Transport {
  pub fn new(
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    breaker: Arc<CircuitBreaker>,
    notices: NoticeSink,
    max_retries: u32,
  ) -> Self {
    Self {
      backend,
      session,
      breaker,
      notices,
      max_retries,
      backoff_unit: Duration::from_secs(1),
    }
  }

  /// Set the unit of the exponential backoff (delay = unit * 2^attempt).
  pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
    self.backoff_unit = unit;
    self
  }

  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  pub fn breaker(&self) -> &Arc<CircuitBreaker> {
    &self.breaker
  }

  /// Send a request, returning the successful response.
  ///
  /// 5xx responses are retried with exponential backoff up to the retry
  /// cap, unless the circuit opens in between. A 401 triggers one
  /// (shared) token refresh and a single replay.
  pub async fn send(&self, request: ApiRequest) -> Result<HttpResponse, TransportError> {
    let correlation_id = Uuid::new_v4().to_string();
    let span = info_span!(
      "request",
      id = %correlation_id,
      method = %request.method,
      path = %request.path
    );

    self.send_tagged(request, &correlation_id).instrument(span).await
  }

  async fn send_tagged(
    &self,
    mut request: ApiRequest,
    correlation_id: &str,
  ) -> Result<HttpResponse, TransportError> {
    let mut retries = 0u32;

    loop {
      let token = self.session.access_token();
      let response = self
        .attempt(&request, token.clone(), None, correlation_id)
        .await?;

      if response.is_success() {
        return Ok(response);
      }

      match response.status {
        401 if !request.tag.refreshed && !request.tag.skip_refresh && token.is_some() => {
          debug!("Unauthorized, refreshing token");
          self.refresh(token.as_deref()).await?;
          request.tag.refreshed = true;
        }
        500..=599 if retries < self.max_retries => {
          if self.breaker.is_open() {
            return Err(response.into_error());
          }
          let delay = self.backoff_delay(retries);
          warn!(
            status = response.status,
            attempt = retries + 1,
            delay_ms = delay.as_millis() as u64,
            "Server error, retrying"
          );
          tokio::time::sleep(delay).await;
          retries += 1;
          request.tag.retried = true;
        }
        _ => return Err(response.into_error()),
      }
    }
  }

  fn backoff_delay(&self, attempt: u32) -> Duration {
    self.backoff_unit.saturating_mul(2u32.saturating_pow(attempt))
  }

  /// One network attempt through the breaker.
  async fn attempt(
    &self,
    request: &ApiRequest,
    bearer: Option<String>,
    session_token: Option<String>,
    correlation_id: &str,
  ) -> Result<HttpResponse, TransportError> {
    let permit = self.breaker.acquire()?;

    let outgoing = OutgoingRequest {
      method: request.method.clone(),
      path: request.path.clone(),
      query: request.query.clone(),
      body: request.body.clone(),
      bearer,
      session_token,
      correlation_id: correlation_id.to_string(),
    };

    debug!(retried = request.tag.retried, refreshed = request.tag.refreshed, "Sending");

    match self.backend.execute(outgoing).await {
      Ok(response) => {
        permit.success();
        Ok(response)
      }
      Err(e) => {
        warn!("Request failed without response: {}", e);
        if permit.failure() == Trip::Opened {
          self.notices.send(Notice::ServiceUnavailable);
        }
        Err(e)
      }
    }
  }

  async fn refresh(&self, stale_token: Option<&str>) -> Result<String, TransportError> {
    let transport = self.clone();
    self
      .session
      .refresh_token(stale_token, move |session_token| {
        async move { transport.request_new_token(session_token).await }.boxed()
      })
      .await
  }

  async fn request_new_token(&self, session_token: Option<String>) -> Result<String, TransportError> {
    let correlation_id = Uuid::new_v4().to_string();
    let request = ApiRequest::get(REFRESH_PATH).without_refresh();

    let response = self
      .attempt(&request, None, session_token, &correlation_id)
      .instrument(info_span!("refresh", id = %correlation_id))
      .await?;

    if !response.is_success() {
      return Err(response.into_error());
    }

    envelope::access_token(&response.body)
      .ok_or_else(|| TransportError::Decode("refresh response has no access token".into()))
  }
}


#[cfg(test)]
mod tests {
  use super::testing::*;
  use super::*;
  use crate::notice::drain;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  #[tokio::test]
  async fn test_injects_bearer_and_correlation_id() {
    let backend = Arc::new(ScriptedBackend::new(|_| ok(json!({}))));
    let transport = transport_with(backend.clone(), authed_session("tok"), NoticeSink::discard());

    transport.send(ApiRequest::get("/users/me")).await.unwrap();
    transport.send(ApiRequest::get("/users/me")).await.unwrap();

    let requests = backend.requests();
    assert_eq!(requests[0].bearer.as_deref(), Some("tok"));
    assert!(!requests[0].correlation_id.is_empty());
    assert_ne!(requests[0].correlation_id, requests[1].correlation_id);
  }

  #[tokio::test(start_paused = true)]
  async fn test_breaker_scenario_without_network_attempts_while_open() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let backend = Arc::new(ScriptedBackend::new(move |_| {
      if flag.load(Ordering::SeqCst) {
        ok(json!([]))
      } else {
        refused()
      }
    }));
    let (notices, mut rx) = NoticeSink::channel();
    let transport = transport_with(backend.clone(), authed_session("t"), notices);

    for _ in 0..3 {
      let err = transport.send(ApiRequest::get("/yeets")).await.unwrap_err();
      assert!(err.is_network_level());
    }
    assert_eq!(transport.breaker().state(), CircuitState::Closed);

    for _ in 0..2 {
      transport.send(ApiRequest::get("/yeets")).await.unwrap_err();
    }
    assert_eq!(transport.breaker().state(), CircuitState::Open);
    assert_eq!(backend.requests().len(), 5);

    let err = transport.send(ApiRequest::get("/yeets")).await.unwrap_err();
    assert_eq!(err, TransportError::CircuitOpen);
    let err = transport.send(ApiRequest::get("/yeets")).await.unwrap_err();
    assert_eq!(err, TransportError::CircuitOpen);
    assert_eq!(backend.requests().len(), 5);

    // One notice for the trip, none for short-circuited calls
    assert_eq!(drain(&mut rx), vec![Notice::ServiceUnavailable]);

    tokio::time::advance(Duration::from_secs(60)).await;
    healthy.store(true, Ordering::SeqCst);
    transport.send(ApiRequest::get("/yeets")).await.unwrap();

    assert_eq!(transport.breaker().state(), CircuitState::Closed);
    assert_eq!(transport.breaker().consecutive_failures(), 0);
    assert_eq!(backend.requests().len(), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_5xx_with_exponential_backoff() {
    let backend = Arc::new(ScriptedBackend::new(|_| status(503)));
    let transport = transport_with(backend.clone(), authed_session("t"), NoticeSink::discard());

    let started = tokio::time::Instant::now();
    let err = transport.send(ApiRequest::get("/yeets")).await.unwrap_err();

    assert_eq!(err.status(), Some(503));
    // Initial attempt plus three retries
    assert_eq!(backend.requests().len(), 4);
    // 1s + 2s + 4s
    assert_eq!(started.elapsed(), Duration::from_secs(7));
    // A 5xx is a response, so the breaker is untouched
    assert_eq!(transport.breaker().consecutive_failures(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_recovers_transparently() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let backend = Arc::new(ScriptedBackend::new(move |_| {
      if counter.fetch_add(1, Ordering::SeqCst) < 2 {
        status(500)
      } else {
        ok(json!({"ok": true}))
      }
    }));
    let transport = transport_with(backend.clone(), authed_session("t"), NoticeSink::discard());

    let response = transport.send(ApiRequest::get("/yeets")).await.unwrap();
    assert_eq!(response.body, json!({"ok": true}));
    assert_eq!(backend.requests().len(), 3);
  }

  #[tokio::test]
  async fn test_4xx_is_never_retried() {
    let backend = Arc::new(ScriptedBackend::new(|_| {
      Ok(HttpResponse::new(422, json!({"error": "bad input"})))
    }));
    let transport = transport_with(backend.clone(), authed_session("t"), NoticeSink::discard());

    let err = transport.send(ApiRequest::post("/yeets")).await.unwrap_err();
    assert_eq!(
      err,
      TransportError::Http {
        status: 422,
        message: "bad input".into()
      }
    );
    assert_eq!(backend.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_401s_issue_one_refresh() {
    let backend = Arc::new(
      ScriptedBackend::new(|req| {
        if req.path == REFRESH_PATH {
          assert_eq!(req.session_token.as_deref(), Some("sess"));
          return ok(json!({"accessToken": "fresh"}));
        }
        match req.bearer.as_deref() {
          Some("fresh") => ok(json!({"id": "me"})),
          _ => status(401),
        }
      })
      .with_delay(Duration::from_millis(10)),
    );
    let session = authed_session("stale");
    let transport = transport_with(backend.clone(), session.clone(), NoticeSink::discard());

    let calls: Vec<_> = (0..6)
      .map(|_| {
        let transport = transport.clone();
        tokio::spawn(async move { transport.send(ApiRequest::get("/users/me")).await })
      })
      .collect();

    for call in calls {
      assert_eq!(call.await.unwrap().unwrap().body, json!({"id": "me"}));
    }
    assert_eq!(backend.count("GET", REFRESH_PATH), 1);
    assert_eq!(session.access_token().as_deref(), Some("fresh"));
  }

  #[tokio::test]
  async fn test_second_401_after_refresh_is_final() {
    let backend = Arc::new(ScriptedBackend::new(|req| {
      if req.path == REFRESH_PATH {
        ok(json!({"accessToken": "fresh"}))
      } else {
        status(401)
      }
    }));
    let transport = transport_with(backend.clone(), authed_session("stale"), NoticeSink::discard());

    let err = transport.send(ApiRequest::get("/users/me")).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(backend.count("GET", "/users/me"), 2);
    assert_eq!(backend.count("GET", REFRESH_PATH), 1);
  }

  #[tokio::test]
  async fn test_rejected_refresh_expires_session() {
    let backend = Arc::new(ScriptedBackend::new(|_| status(401)));
    let (notices, mut rx) = NoticeSink::channel();
    let store = crate::session::MemoryCredentialStore::with_credentials(
      crate::session::Credentials::new("stale"),
    );
    let session = Arc::new(Session::new(Box::new(store), 2, notices.clone()));
    let transport = transport_with(backend, session.clone(), notices);

    let err = transport.send(ApiRequest::get("/users/me")).await.unwrap_err();
    assert_eq!(err, TransportError::AuthExpired);
    assert!(!session.is_authenticated());
    assert_eq!(drain(&mut rx), vec![Notice::SessionExpired]);
  }

  #[tokio::test]
  async fn test_skip_refresh_requests_return_401() {
    let backend = Arc::new(ScriptedBackend::new(|_| status(401)));
    let transport = transport_with(backend.clone(), authed_session("t"), NoticeSink::discard());

    let err = transport
      .send(ApiRequest::post("/auth/login").without_refresh())
      .await
      .unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(backend.requests().len(), 1);
  }
}
