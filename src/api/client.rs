//! Typed backend endpoints on top of [`Transport`].

use serde_json::{json, Value};
use tracing::{info, instrument};
use url::{form_urlencoded, Url};

use crate::error::TransportError;
use crate::session::Credentials;
use crate::transport::{ApiRequest, Transport};

use super::api_types;
use super::envelope::{self, ListEnvelope, NormalizedPage};
use super::types::{
  AuthGrant, Comment, FeedItem, ItemUpdate, NewItem, Notification, ProfileUpdate, Registration,
  UnreadCount, UserProfile,
};

/// Absolute request path from segments, each percent-encoded so an id
/// cannot add segments, a query or a fragment.
pub fn resource_path(segments: &[&str]) -> String {
  let Ok(mut url) = Url::parse("http://localhost/") else {
    let encoded: Vec<String> = segments
      .iter()
      .map(|s| form_urlencoded::byte_serialize(s.as_bytes()).collect())
      .collect();
    return format!("/{}", encoded.join("/"));
  };
  if let Ok(mut path) = url.path_segments_mut() {
    path.clear().extend(segments);
  }
  url.path().to_string()
}

/// A paginated list endpoint: path, fixed query parameters and envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEndpoint {
  pub path: String,
  pub params: Vec<(String, String)>,
  pub envelope: ListEnvelope,
}

impl ListEndpoint {
  pub fn new(path: impl Into<String>, envelope: ListEnvelope) -> Self {
    Self {
      path: path.into(),
      params: Vec::new(),
      envelope,
    }
  }

  pub fn param(mut self, key: &str, value: impl ToString) -> Self {
    self.params.push((key.to_string(), value.to_string()));
    self
  }

  pub fn feed() -> Self {
    Self::new("/yeets/feed", envelope::ITEMS)
  }

  pub fn all_items() -> Self {
    Self::new("/yeets", envelope::ITEMS)
  }

  pub fn user_items(user_id: &str) -> Self {
    Self::new(resource_path(&["users", user_id, "yeets"]), envelope::ITEMS)
  }

  pub fn search_items(query: &str) -> Self {
    Self::new("/yeets/search", envelope::ITEMS).param("q", query)
  }

  pub fn users(search: Option<&str>) -> Self {
    let endpoint = Self::new("/users", envelope::USERS);
    match search {
      Some(q) if !q.is_empty() => endpoint.param("search", q),
      _ => endpoint,
    }
  }

  pub fn followers(user_id: &str) -> Self {
    Self::new(resource_path(&["users", user_id, "followers"]), envelope::USERS)
  }

  pub fn following(user_id: &str) -> Self {
    Self::new(resource_path(&["users", user_id, "following"]), envelope::USERS)
  }

  pub fn notifications() -> Self {
    Self::new("/notifications", envelope::NOTIFICATIONS)
  }
}

/// Typed endpoint calls. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
  transport: Transport,
}

impl ApiClient {
  pub fn new(transport: Transport) -> Self {
    Self { transport }
  }

  pub fn transport(&self) -> &Transport {
    &self.transport
  }

  async fn send(&self, request: ApiRequest) -> Result<Value, TransportError> {
    Ok(self.transport.send(request).await?.body)
  }

  // ==========================================================================
  // Auth
  // ==========================================================================

  /// Exchange credentials for a token and start a new session.
  #[instrument(skip(self, password))]
  pub async fn login(&self, email: &str, password: &str) -> Result<AuthGrant, TransportError> {
    let body = self
      .send(
        ApiRequest::post("/auth/login")
          .json(json!({ "email": email, "password": password }))
          .without_refresh(),
      )
      .await?;
    self.begin_session(body)
  }

  #[instrument(skip(self, registration), fields(username = %registration.username))]
  pub async fn register(&self, registration: &Registration) -> Result<AuthGrant, TransportError> {
    let body = self
      .send(ApiRequest::post("/register").json(registration).without_refresh())
      .await?;
    self.begin_session(body)
  }

  fn begin_session(&self, body: Value) -> Result<AuthGrant, TransportError> {
    let access_token = envelope::access_token(&body)
      .ok_or_else(|| TransportError::Decode("auth response has no access token".into()))?;
    let session_token = envelope::session_token(&body);
    let user = body
      .get("user")
      .or_else(|| body.pointer("/data/user"))
      .cloned()
      .and_then(|raw| envelope::user_profile(raw).ok());

    let mut credentials = Credentials::new(access_token.clone());
    if let Some(session) = &session_token {
      credentials = credentials.with_session_token(session.clone());
    }
    if let Some(user) = &user {
      credentials = credentials.with_user_id(user.id.clone());
    }
    self.transport.session().start(credentials);
    info!(user = ?user.as_ref().map(|u| &u.handle), "Session started");

    Ok(AuthGrant {
      access_token,
      session_token,
      user,
    })
  }

  /// Tell the server the session ended. Local teardown is the caller's.
  pub async fn logout(&self) -> Result<(), TransportError> {
    self
      .send(ApiRequest::post("/auth/logout").without_refresh())
      .await
      .map(|_| ())
  }

  /// Check the current token, returning the user it belongs to.
  pub async fn verify(&self) -> Result<UserProfile, TransportError> {
    let body = self.send(ApiRequest::get("/auth/verify")).await?;
    envelope::USER.decode(body, envelope::user_profile)
  }

  // ==========================================================================
  // Lists
  // ==========================================================================

  /// Fetch one page of a list endpoint, normalized but not yet mapped.
  pub async fn list_page(
    &self,
    endpoint: &ListEndpoint,
    page: u32,
    limit: u32,
  ) -> Result<NormalizedPage<Value>, TransportError> {
    let mut request = ApiRequest::get(endpoint.path.clone())
      .query("page", page)
      .query("limit", limit);
    for (key, value) in &endpoint.params {
      request = request.query(key, value);
    }
    let body = self.send(request).await?;
    endpoint.envelope.normalize(body)
  }

  // ==========================================================================
  // Feed items
  // ==========================================================================

  pub async fn get_item(&self, id: &str) -> Result<FeedItem, TransportError> {
    let body = self.send(ApiRequest::get(resource_path(&["yeets", id]))).await?;
    envelope::ITEM.decode(body, envelope::feed_item)
  }

  pub async fn create_item(&self, item: &NewItem) -> Result<FeedItem, TransportError> {
    let body = self.send(ApiRequest::post("/yeets").json(item)).await?;
    envelope::ITEM.decode(body, envelope::feed_item)
  }

  pub async fn update_item(&self, id: &str, update: &ItemUpdate) -> Result<FeedItem, TransportError> {
    let body = self
      .send(ApiRequest::patch(resource_path(&["yeets", id])).json(update))
      .await?;
    envelope::ITEM.decode(body, envelope::feed_item)
  }

  pub async fn delete_item(&self, id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["yeets", id])))
      .await
      .map(|_| ())
  }

  pub async fn like_item(&self, id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::post(resource_path(&["yeets", id, "like"])))
      .await
      .map(|_| ())
  }

  pub async fn unlike_item(&self, id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["yeets", id, "like"])))
      .await
      .map(|_| ())
  }

  pub async fn retweet_item(&self, id: &str, comment: Option<&str>) -> Result<(), TransportError> {
    let mut request = ApiRequest::post(resource_path(&["yeets", id, "retweet"]));
    if let Some(comment) = comment {
      request = request.json(json!({ "comment": comment }));
    }
    self.send(request).await.map(|_| ())
  }

  pub async fn unretweet_item(&self, id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["yeets", id, "retweet"])))
      .await
      .map(|_| ())
  }

  pub async fn add_comment(&self, item_id: &str, text: &str) -> Result<Comment, TransportError> {
    let body = self
      .send(ApiRequest::post(resource_path(&["yeets", item_id, "comments"])).json(json!({ "text": text })))
      .await?;
    envelope::COMMENT.decode(body, envelope::comment)
  }

  pub async fn delete_comment(&self, comment_id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["comments", comment_id])))
      .await
      .map(|_| ())
  }

  // ==========================================================================
  // Users
  // ==========================================================================

  pub async fn get_user(&self, id: &str) -> Result<UserProfile, TransportError> {
    let body = self.send(ApiRequest::get(resource_path(&["users", id]))).await?;
    envelope::USER.decode(body, envelope::user_profile)
  }

  pub async fn current_user(&self) -> Result<UserProfile, TransportError> {
    let body = self.send(ApiRequest::get("/users/me")).await?;
    envelope::USER.decode(body, envelope::user_profile)
  }

  pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, TransportError> {
    let body = self.send(ApiRequest::patch("/users/me").json(update)).await?;
    envelope::USER.decode(body, envelope::user_profile)
  }

  pub async fn follow(&self, user_id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::post(resource_path(&["users", user_id, "follow"])))
      .await
      .map(|_| ())
  }

  pub async fn unfollow(&self, user_id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["users", user_id, "follow"])))
      .await
      .map(|_| ())
  }

  pub async fn block(&self, user_id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::post(resource_path(&["users", user_id, "block"])))
      .await
      .map(|_| ())
  }

  pub async fn unblock(&self, user_id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["users", user_id, "block"])))
      .await
      .map(|_| ())
  }

  // ==========================================================================
  // Notifications
  // ==========================================================================

  pub async fn unread_count(&self) -> Result<UnreadCount, TransportError> {
    let body = self.send(ApiRequest::get("/notifications/unread-count")).await?;
    api_types::unread_count(&body)
      .ok_or_else(|| TransportError::Decode("unrecognized unread count".into()))
  }

  pub async fn mark_read(&self, id: &str) -> Result<Option<Notification>, TransportError> {
    let body = self
      .send(ApiRequest::patch(resource_path(&["notifications", id, "read"])))
      .await?;
    // Some deployments answer with the updated notification, others with nothing
    Ok(envelope::NOTIFICATION.decode(body, envelope::notification).ok())
  }

  pub async fn mark_all_read(&self) -> Result<(), TransportError> {
    self
      .send(ApiRequest::patch("/notifications/mark-all-read"))
      .await
      .map(|_| ())
  }

  pub async fn delete_notification(&self, id: &str) -> Result<(), TransportError> {
    self
      .send(ApiRequest::delete(resource_path(&["notifications", id])))
      .await
      .map(|_| ())
  }
}
