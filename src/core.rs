//! Session-scoped wiring of transport, cache, fetchers, push bridge and
//! mutation orchestrators.

use color_eyre::{eyre::WrapErr, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{ApiClient, AuthGrant, FeedItem, Notification, Registration, UnreadCount, UserProfile};
use crate::cache::{keys, CacheLayer, CacheResult, EntityCache};
use crate::config::Config;
use crate::error::{PushError, TransportError};
use crate::mutations::{ItemMutations, MutationContext, NotificationMutations, UserMutations};
use crate::notice::{NoticeReceiver, NoticeSink};
use crate::paging::Paginator;
use crate::push::{PushBridge, SseConnector};
use crate::session::{CredentialStore, Session};
use crate::transport::{CircuitBreaker, CircuitState, ReqwestBackend, Transport};

/// Everything one client session needs. Build it at startup, call
/// [`Core::logout`] to tear the session down.
pub struct Core {
  config: Config,
  session: Arc<Session>,
  api: ApiClient,
  reads: CacheLayer,
  push: PushBridge,

  feed: Paginator<FeedItem>,
  timeline: Paginator<FeedItem>,
  inbox: Paginator<Notification>,

  items: ItemMutations,
  users: UserMutations,
  notifications: NotificationMutations,
}

impl Core {
  /// Wire up a core over the real HTTP backend. Notices for the UI arrive
  /// on the returned receiver.
  pub fn new(config: Config, store: Box<dyn CredentialStore>) -> Result<(Self, NoticeReceiver)> {
    let (notices, receiver) = NoticeSink::channel();

    let session = Arc::new(Session::new(
      store,
      config.auth.max_refresh_attempts,
      notices.clone(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
      config.circuit.failure_threshold,
      config.circuit.cooldown(),
    ));
    let backend = ReqwestBackend::new(&config.api.base_url, config.api.timeout())
      .wrap_err_with(|| format!("Invalid API base URL: {}", config.api.base_url))?;
    let transport = Transport::new(
      Arc::new(backend),
      Arc::clone(&session),
      breaker,
      notices.clone(),
      config.api.max_retries,
    );
    let api = ApiClient::new(transport);

    let cache = EntityCache::new(config.cache.default_ttl());
    let connector = SseConnector::new(&config.push_url(), config.api.timeout())
      .wrap_err_with(|| format!("Invalid push URL: {}", config.push_url()))?;
    let push = PushBridge::new(
      Arc::new(connector),
      Arc::clone(&session),
      cache.clone(),
      notices.clone(),
    );

    let ctx = MutationContext::new(
      api.clone(),
      cache.clone(),
      notices,
      config.cache.detail_ttl(),
    );

    let core = Self {
      feed: Paginator::feed(api.clone(), cache.clone(), &config),
      timeline: Paginator::timeline(api.clone(), cache.clone(), &config),
      inbox: Paginator::inbox(api.clone(), cache.clone(), &config),
      items: ItemMutations::new(ctx.clone()),
      users: UserMutations::new(ctx.clone()),
      notifications: NotificationMutations::new(ctx),
      reads: CacheLayer::new(cache),
      config,
      session,
      api,
      push,
    };
    Ok((core, receiver))
  }

  // ==========================================================================
  // Session
  // ==========================================================================

  pub fn is_authenticated(&self) -> bool {
    self.session.is_authenticated()
  }

  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  pub fn circuit_state(&self) -> CircuitState {
    self.api.transport().breaker().state()
  }

  /// Log in and, when enabled, open the push channel. Data cached for a
  /// previous session is dropped first.
  pub async fn login(&self, email: &str, password: &str) -> Result<AuthGrant, TransportError> {
    self.teardown();
    let grant = self.api.login(email, password).await?;
    self.start_push().await;
    Ok(grant)
  }

  pub async fn register(&self, registration: &Registration) -> Result<AuthGrant, TransportError> {
    self.teardown();
    let grant = self.api.register(registration).await?;
    self.start_push().await;
    Ok(grant)
  }

  pub async fn verify(&self) -> Result<UserProfile, TransportError> {
    self.api.verify().await
  }

  /// End the session. Local state is torn down even when the server call
  /// fails.
  pub async fn logout(&self) {
    if self.session.is_authenticated() {
      if let Err(e) = self.api.logout().await {
        warn!("Server logout failed: {}", e);
      }
    }
    self.teardown();
    self.session.clear();
    info!("Logged out");
  }

  fn teardown(&self) {
    self.push.disconnect();
    self.reads.cache().clear();
    self.feed.reset();
    self.timeline.reset();
    self.inbox.reset();
  }

  // ==========================================================================
  // Push
  // ==========================================================================

  pub fn push(&self) -> &PushBridge {
    &self.push
  }

  pub async fn connect_push(&self) -> Result<(), PushError> {
    self.push.connect().await
  }

  async fn start_push(&self) {
    if !self.config.push.enabled {
      return;
    }
    if let Err(e) = self.push.connect().await {
      // Lists still refresh on their TTL
      warn!("Push channel unavailable: {}", e);
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn cache(&self) -> &EntityCache {
    self.reads.cache()
  }

  pub async fn item(&self, id: &str) -> Result<CacheResult<FeedItem>, TransportError> {
    self
      .reads
      .fetch(&keys::items::detail(id), self.config.cache.detail_ttl(), || {
        self.api.get_item(id)
      })
      .await
  }

  pub async fn user(&self, id: &str) -> Result<CacheResult<UserProfile>, TransportError> {
    self
      .reads
      .fetch(&keys::users::detail(id), self.config.cache.detail_ttl(), || {
        self.api.get_user(id)
      })
      .await
  }

  pub async fn current_user(&self) -> Result<CacheResult<UserProfile>, TransportError> {
    self
      .reads
      .fetch(&keys::users::me(), self.config.cache.detail_ttl(), || {
        self.api.current_user()
      })
      .await
  }

  pub async fn unread_count(&self) -> Result<CacheResult<UnreadCount>, TransportError> {
    self
      .reads
      .fetch(
        &keys::notifications::unread_count(),
        self.config.cache.notification_ttl(),
        || self.api.unread_count(),
      )
      .await
  }

  // ==========================================================================
  // Lists
  // ==========================================================================

  pub fn feed(&self) -> &Paginator<FeedItem> {
    &self.feed
  }

  pub fn timeline(&self) -> &Paginator<FeedItem> {
    &self.timeline
  }

  pub fn inbox(&self) -> &Paginator<Notification> {
    &self.inbox
  }

  pub fn user_items(&self, user_id: &str) -> Paginator<FeedItem> {
    Paginator::<FeedItem>::by_user(self.api.clone(), self.cache().clone(), &self.config, user_id)
  }

  pub fn search_items(&self, query: &str) -> Paginator<FeedItem> {
    Paginator::<FeedItem>::search(self.api.clone(), self.cache().clone(), &self.config, query)
  }

  pub fn search_users(&self, query: Option<&str>) -> Paginator<UserProfile> {
    Paginator::<UserProfile>::search(self.api.clone(), self.cache().clone(), &self.config, query)
  }

  pub fn followers(&self, user_id: &str) -> Paginator<UserProfile> {
    Paginator::followers(self.api.clone(), self.cache().clone(), &self.config, user_id)
  }

  pub fn following(&self, user_id: &str) -> Paginator<UserProfile> {
    Paginator::following(self.api.clone(), self.cache().clone(), &self.config, user_id)
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  pub fn items(&self) -> &ItemMutations {
    &self.items
  }

  pub fn users(&self) -> &UserMutations {
    &self.users
  }

  pub fn notifications(&self) -> &NotificationMutations {
    &self.notifications
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::session::{Credentials, MemoryCredentialStore};
  use serde_json::json;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.push.enabled = false;
    config
  }

  #[tokio::test]
  async fn test_login_then_cached_reads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/auth/login"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "accessToken": "tok",
        "refreshToken": "sess",
        "user": {"_id": "u1", "username": "ann"}
      })))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/yeets/7"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "7", "content": "hi"})))
      .expect(1)
      .mount(&server)
      .await;

    let (core, _notices) =
      Core::new(config_for(&server), Box::new(MemoryCredentialStore::new())).unwrap();
    let grant = core.login("ann@example.com", "pw").await.unwrap();
    assert_eq!(grant.user.map(|u| u.id).as_deref(), Some("u1"));
    assert_eq!(core.session().user_id().as_deref(), Some("u1"));

    let first = core.item("7").await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = core.item("7").await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.content, "hi");
  }

  #[tokio::test]
  async fn test_logout_tears_down_even_when_server_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/auth/logout"))
      .respond_with(ResponseTemplate::new(400))
      .expect(1)
      .mount(&server)
      .await;

    let store = MemoryCredentialStore::with_credentials(Credentials::new("tok"));
    let (core, _notices) = Core::new(config_for(&server), Box::new(store)).unwrap();
    core
      .cache()
      .set(&keys::items::feed(), &Vec::<FeedItem>::new(), None);

    core.logout().await;

    assert!(!core.is_authenticated());
    assert!(!core.cache().contains(&keys::items::feed()));
    assert!(!core.push().is_connected());
  }

  #[test]
  fn test_rejects_bad_base_url() {
    let mut config = Config::default();
    config.api.base_url = "not a url".into();
    assert!(Core::new(config, Box::new(MemoryCredentialStore::new())).is_err());
  }
}
