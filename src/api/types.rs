//! Canonical domain types.
//!
//! Every wire shape the backend produces is mapped onto exactly one of
//! these in `api_types`; the cache and the rest of the crate only ever
//! see this schema.

use serde::{Deserialize, Serialize};

/// A post in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
  pub id: String,
  pub author_id: Option<String>,
  pub author_handle: Option<String>,
  pub content: String,
  pub image: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  pub like_count: u64,
  pub is_liked: bool,
  pub retweet_count: u64,
  pub is_retweeted: bool,
  pub comment_count: u64,
  #[serde(default)]
  pub comments: Vec<Comment>,
  pub created_at: Option<String>,
}

impl FeedItem {
  /// Locally created items carry a temporary id until the server confirms.
  pub fn is_temporary(&self) -> bool {
    self.id.starts_with(TEMP_ID_PREFIX)
  }
}

/// Prefix of ids minted client-side before server confirmation.
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
  pub id: String,
  pub item_id: Option<String>,
  pub author_id: Option<String>,
  pub author_handle: Option<String>,
  pub text: String,
  pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  pub handle: String,
  pub display_name: String,
  pub avatar: String,
  pub bio: Option<String>,
  pub follower_count: u64,
  pub following_count: u64,
  pub is_following: bool,
  pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub id: String,
  /// Backend event kind, e.g. "like", "follow", "comment"
  pub kind: String,
  pub message: String,
  pub read: bool,
  pub item_id: Option<String>,
  pub actor_id: Option<String>,
  pub created_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
  pub count: u64,
}

impl UnreadCount {
  pub fn increment(self) -> Self {
    Self {
      count: self.count.saturating_add(1),
    }
  }

  /// Never goes below zero.
  pub fn decrement(self) -> Self {
    Self {
      count: self.count.saturating_sub(1),
    }
  }
}

/// Result of a successful login or registration.
#[derive(Debug, Clone)]
pub struct AuthGrant {
  pub access_token: String,
  pub session_token: Option<String>,
  pub user: Option<UserProfile>,
}

/// Body of a new feed item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewItem {
  pub content: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
}

/// Partial edit of a feed item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ItemUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
}

/// Partial edit of the signed-in user's profile.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bio: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
  pub username: String,
  pub email: String,
  pub password: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fullname: Option<String>,
}
