//! Session-scoped auth state: current credentials, the per-session refresh
//! budget, and the single in-flight token refresh.

mod store;

pub use store::{CredentialStore, Credentials, MemoryCredentialStore, SqliteCredentialStore};

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::TransportError;
use crate::notice::{Notice, NoticeSink};

/// Outcome of a token refresh: the new access token.
pub type RefreshOutcome = Result<String, TransportError>;

type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct AuthState {
  credentials: Option<Credentials>,
  refresh_attempts: u32,
  pending_refresh: Option<PendingRefresh>,
  /// Bumped on every start/clear so a refresh from an old session is ignored
  generation: u64,
}

/// Explicit session state, created at startup and torn down on logout.
pub struct Session {
  store: Box<dyn CredentialStore>,
  state: Mutex<AuthState>,
  max_refresh_attempts: u32,
  notices: NoticeSink,
}

enum RefreshPlan {
  Join(PendingRefresh),
  AlreadyRefreshed(String),
  Exhausted,
}

impl Session {
  /// Create a session, restoring any persisted credentials.
  pub fn new(
    store: Box<dyn CredentialStore>,
    max_refresh_attempts: u32,
    notices: NoticeSink,
  ) -> Self {
    let credentials = store.load().unwrap_or_else(|e| {
      warn!("Failed to load persisted credentials: {}", e);
      None
    });

    Self {
      store,
      state: Mutex::new(AuthState {
        credentials,
        refresh_attempts: 0,
        pending_refresh: None,
        generation: 0,
      }),
      max_refresh_attempts,
      notices,
    }
  }

  fn lock(&self) -> MutexGuard<'_, AuthState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_authenticated(&self) -> bool {
    self.lock().credentials.is_some()
  }

  pub fn access_token(&self) -> Option<String> {
    self.lock().credentials.as_ref().map(|c| c.access_token.clone())
  }

  pub fn credentials(&self) -> Option<Credentials> {
    self.lock().credentials.clone()
  }

  pub fn user_id(&self) -> Option<String> {
    self.lock().credentials.as_ref().and_then(|c| c.user_id.clone())
  }

  /// Refreshes started in this session.
  pub fn refresh_attempts(&self) -> u32 {
    self.lock().refresh_attempts
  }

  /// Begin a new session with fresh credentials.
  pub fn start(&self, credentials: Credentials) {
    if let Err(e) = self.store.save(&credentials) {
      warn!("Failed to persist credentials: {}", e);
    }

    let mut state = self.lock();
    state.credentials = Some(credentials);
    state.refresh_attempts = 0;
    state.pending_refresh = None;
    state.generation += 1;
    info!("Session started");
  }

  /// Drop all credentials, in memory and persisted.
  ///
  /// Returns whether the session was authenticated before the call.
  pub fn clear(&self) -> bool {
    if let Err(e) = self.store.clear() {
      warn!("Failed to clear persisted credentials: {}", e);
    }

    let mut state = self.lock();
    let was_authenticated = state.credentials.take().is_some();
    state.refresh_attempts = 0;
    state.pending_refresh = None;
    state.generation += 1;
    info!("Session cleared");
    was_authenticated
  }

  /// Clear the session because refresh failed; notifies once per session.
  fn expire(&self) {
    if self.clear() {
      self.notices.send(Notice::SessionExpired);
    }
  }

  /// Obtain a new access token, coalescing concurrent callers.
  ///
  /// `stale_token` is the token the failed request carried. If the session
  /// already holds a different token, that token is returned without a
  /// network call. Otherwise the caller joins the pending refresh, or starts
  /// one via `refresher` (which receives the session credential) if the
  /// per-session budget allows. Exhausting the budget or a rejected refresh
  /// clears the session and yields `AuthExpired`.
  pub async fn refresh_token<F>(self: &Arc<Self>, stale_token: Option<&str>, refresher: F) -> RefreshOutcome
  where
    F: FnOnce(Option<String>) -> BoxFuture<'static, RefreshOutcome>,
  {
    let plan = self.plan_refresh(stale_token, refresher);

    match plan {
      RefreshPlan::Join(pending) => pending.await,
      RefreshPlan::AlreadyRefreshed(token) => Ok(token),
      RefreshPlan::Exhausted => {
        warn!(
          "Token refresh budget of {} exhausted",
          self.max_refresh_attempts
        );
        self.expire();
        Err(TransportError::AuthExpired)
      }
    }
  }

  fn plan_refresh<F>(self: &Arc<Self>, stale_token: Option<&str>, refresher: F) -> RefreshPlan
  where
    F: FnOnce(Option<String>) -> BoxFuture<'static, RefreshOutcome>,
  {
    let mut state = self.lock();

    if let Some(pending) = &state.pending_refresh {
      return RefreshPlan::Join(pending.clone());
    }

    let (current_token, session_token) = match &state.credentials {
      Some(c) => (c.access_token.clone(), c.session_token.clone()),
      None => return RefreshPlan::Exhausted,
    };

    if stale_token.is_some_and(|t| t != current_token) {
      return RefreshPlan::AlreadyRefreshed(current_token);
    }

    if state.refresh_attempts >= self.max_refresh_attempts {
      return RefreshPlan::Exhausted;
    }

    state.refresh_attempts += 1;
    let generation = state.generation;
    let request = refresher(session_token);
    let session = Arc::clone(self);

    let pending = async move {
      let outcome = request.await;
      session.finish_refresh(generation, outcome)
    }
    .boxed()
    .shared();

    state.pending_refresh = Some(pending.clone());
    RefreshPlan::Join(pending)
  }

  fn finish_refresh(&self, generation: u64, outcome: RefreshOutcome) -> RefreshOutcome {
    let mut state = self.lock();
    if state.generation != generation {
      // Logged out or re-authenticated while the refresh was in flight
      return Err(TransportError::AuthExpired);
    }
    state.pending_refresh = None;

    match outcome {
      Ok(token) => {
        let Some(credentials) = state.credentials.as_mut() else {
          return Err(TransportError::AuthExpired);
        };
        credentials.access_token = token.clone();
        let snapshot = credentials.clone();
        drop(state);

        if let Err(e) = self.store.save(&snapshot) {
          warn!("Failed to persist refreshed token: {}", e);
        }
        info!("Access token refreshed");
        Ok(token)
      }
      Err(TransportError::Http { status, .. }) if (400..500).contains(&status) => {
        drop(state);
        warn!("Token refresh rejected with HTTP {}", status);
        self.expire();
        Err(TransportError::AuthExpired)
      }
      Err(TransportError::AuthExpired) => {
        drop(state);
        self.expire();
        Err(TransportError::AuthExpired)
      }
      Err(e) => {
        warn!("Token refresh failed: {}", e);
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn session_with(token: &str, max: u32) -> Arc<Session> {
    let store = MemoryCredentialStore::with_credentials(
      Credentials::new(token).with_session_token("sess-1"),
    );
    Arc::new(Session::new(Box::new(store), max, NoticeSink::discard()))
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_request() {
    let session = session_with("old", 2);
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let session = Arc::clone(&session);
      let calls = Arc::clone(&calls);
      handles.push(tokio::spawn(async move {
        session
          .refresh_token(Some("old"), move |sess| {
            async move {
              calls.fetch_add(1, Ordering::SeqCst);
              assert_eq!(sess.as_deref(), Some("sess-1"));
              tokio::time::sleep(Duration::from_millis(20)).await;
              Ok::<_, TransportError>("new".to_string())
            }
            .boxed()
          })
          .await
      }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap(), Ok("new".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.access_token().as_deref(), Some("new"));
    assert_eq!(session.refresh_attempts(), 1);
  }

  #[tokio::test]
  async fn test_late_caller_reuses_refreshed_token() {
    let session = session_with("new", 2);
    let result = session
      .refresh_token(Some("old"), |_| {
        async { Err::<String, _>(TransportError::Timeout) }.boxed()
      })
      .await;
    assert_eq!(result, Ok("new".to_string()));
    assert_eq!(session.refresh_attempts(), 0);
  }

  #[tokio::test]
  async fn test_budget_exhaustion_clears_session() {
    let session = session_with("t0", 2);

    for i in 1..=2 {
      let current = session.access_token();
      let next = format!("t{}", i);
      let outcome = session
        .refresh_token(current.as_deref(), move |_| async move { Ok::<_, TransportError>(next) }.boxed())
        .await;
      assert!(outcome.is_ok());
    }

    let current = session.access_token();
    let outcome = session
      .refresh_token(current.as_deref(), |_| {
        async { Ok::<_, TransportError>("t3".to_string()) }.boxed()
      })
      .await;
    assert_eq!(outcome, Err(TransportError::AuthExpired));
    assert!(!session.is_authenticated());
  }

  #[tokio::test]
  async fn test_rejected_refresh_clears_session() {
    let (notices, mut rx) = NoticeSink::channel();
    let store =
      MemoryCredentialStore::with_credentials(Credentials::new("t0").with_session_token("s"));
    let session = Arc::new(Session::new(Box::new(store), 2, notices));
    let outcome = session
      .refresh_token(Some("t0"), |_| {
        async {
          Err::<String, _>(TransportError::Http {
            status: 401,
            message: "expired".into(),
          })
        }
        .boxed()
      })
      .await;
    assert_eq!(outcome, Err(TransportError::AuthExpired));
    assert!(!session.is_authenticated());
    assert_eq!(crate::notice::drain(&mut rx), vec![Notice::SessionExpired]);

    // A second caller after expiry does not notify again
    let outcome = session
      .refresh_token(Some("t0"), |_| {
        async { Ok::<_, TransportError>("x".to_string()) }.boxed()
      })
      .await;
    assert_eq!(outcome, Err(TransportError::AuthExpired));
    assert!(crate::notice::drain(&mut rx).is_empty());
  }

  #[tokio::test]
  async fn test_start_resets_budget() {
    let session = session_with("t0", 1);
    session
      .refresh_token(Some("t0"), |_| {
        async { Ok::<_, TransportError>("t1".to_string()) }.boxed()
      })
      .await
      .unwrap();
    assert_eq!(session.refresh_attempts(), 1);

    session.start(Credentials::new("fresh"));
    assert_eq!(session.refresh_attempts(), 0);
    assert_eq!(session.access_token().as_deref(), Some("fresh"));
  }
}
