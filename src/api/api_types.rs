//! Serde-deserializable types matching the backend's JSON.
//!
//! The backend is inconsistent about field names across endpoints, so each
//! known alias is its own optional field and the `into_*` mapping picks the
//! first one present. Kept separate from the canonical types so nothing
//! past this boundary branches on wire shape.

use serde::Deserialize;
use serde_json::Value;

use crate::error::TransportError;

use super::types::{Comment, FeedItem, Notification, UnreadCount, UserProfile};

// ============================================================================
// Loose scalar shapes
// ============================================================================

/// Ids arrive as strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiId {
  Str(String),
  Num(i64),
}

impl ApiId {
  pub fn into_string(self) -> String {
    match self {
      ApiId::Str(s) => s,
      ApiId::Num(n) => n.to_string(),
    }
  }
}

/// Counters arrive as a number or as the list of who did the thing.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiCount {
  Num(i64),
  List(Vec<Value>),
}

impl ApiCount {
  pub fn value(&self) -> u64 {
    match self {
      ApiCount::Num(n) => (*n).max(0) as u64,
      ApiCount::List(items) => items.len() as u64,
    }
  }
}

/// Tags arrive as an array or as one comma separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiTags {
  List(Vec<String>),
  Joined(String),
}

impl ApiTags {
  fn into_vec(self) -> Vec<String> {
    match self {
      ApiTags::List(tags) => tags,
      ApiTags::Joined(s) => s
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect(),
    }
  }
}

/// An author is either a bare id or an embedded user object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiAuthor {
  Id(ApiId),
  User(Box<ApiUser>),
}

fn first_id(candidates: [Option<ApiId>; 3]) -> Option<String> {
  candidates
    .into_iter()
    .flatten()
    .map(ApiId::into_string)
    .find(|id| !id.is_empty())
}

fn first_count(candidates: [Option<ApiCount>; 3]) -> u64 {
  candidates
    .into_iter()
    .flatten()
    .next()
    .map(|c| c.value())
    .unwrap_or(0)
}

fn first_text(candidates: [Option<String>; 3]) -> Option<String> {
  candidates.into_iter().flatten().find(|s| !s.is_empty())
}

fn missing_id(entity: &str) -> TransportError {
  TransportError::Decode(format!("{} has no id", entity))
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUser {
  pub id: Option<ApiId>,
  #[serde(rename = "_id")]
  pub mongo_id: Option<ApiId>,
  pub auth_user_id: Option<ApiId>,
  pub username: Option<String>,
  pub handle: Option<String>,
  pub fullname: Option<String>,
  pub display_name: Option<String>,
  pub image: Option<String>,
  pub avatar: Option<String>,
  pub bio: Option<String>,
  pub follower_count: Option<ApiCount>,
  pub followers_count: Option<ApiCount>,
  pub followers: Option<ApiCount>,
  pub following_count: Option<ApiCount>,
  pub followings_count: Option<ApiCount>,
  pub is_following: Option<bool>,
  pub followed: Option<bool>,
  pub is_blocked: Option<bool>,
  pub blocked: Option<bool>,
}

impl ApiUser {
  pub fn into_profile(self) -> Result<UserProfile, TransportError> {
    let id = first_id([self.id, self.mongo_id, self.auth_user_id]).ok_or_else(|| missing_id("user"))?;

    let handle = first_text([self.username.clone(), self.handle, None]).unwrap_or_else(|| id.clone());
    let display_name = first_text([self.username, self.fullname, self.display_name])
      .unwrap_or_else(|| "Unknown User".to_string());

    Ok(UserProfile {
      handle,
      display_name,
      avatar: first_text([self.image, self.avatar, None]).unwrap_or_default(),
      bio: self.bio,
      follower_count: first_count([self.follower_count, self.followers_count, self.followers]),
      following_count: first_count([self.following_count, self.followings_count, None]),
      is_following: self.is_following.or(self.followed).unwrap_or(false),
      is_blocked: self.is_blocked.or(self.blocked).unwrap_or(false),
      id,
    })
  }
}

// ============================================================================
// Comments
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiComment {
  pub id: Option<ApiId>,
  #[serde(rename = "_id")]
  pub mongo_id: Option<ApiId>,
  pub comment_id: Option<ApiId>,
  pub yeet_id: Option<ApiId>,
  pub author: Option<ApiAuthor>,
  pub user_id: Option<ApiId>,
  pub text: Option<String>,
  pub content: Option<String>,
  pub created_at: Option<String>,
}

impl ApiComment {
  pub fn into_comment(self) -> Result<Comment, TransportError> {
    let id = first_id([self.id, self.mongo_id, self.comment_id]).ok_or_else(|| missing_id("comment"))?;
    let (author_id, author_handle) = split_author(self.author, self.user_id);

    Ok(Comment {
      id,
      item_id: self.yeet_id.map(ApiId::into_string),
      author_id,
      author_handle,
      text: first_text([self.text, self.content, None]).unwrap_or_default(),
      created_at: self.created_at,
    })
  }
}

fn split_author(author: Option<ApiAuthor>, fallback: Option<ApiId>) -> (Option<String>, Option<String>) {
  match author {
    Some(ApiAuthor::Id(id)) => (Some(id.into_string()), None),
    Some(ApiAuthor::User(user)) => match user.into_profile() {
      Ok(profile) => (Some(profile.id), Some(profile.handle)),
      Err(_) => (fallback.map(ApiId::into_string), None),
    },
    None => (fallback.map(ApiId::into_string), None),
  }
}

// ============================================================================
// Feed items
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFeedItem {
  pub id: Option<ApiId>,
  #[serde(rename = "_id")]
  pub mongo_id: Option<ApiId>,
  pub yeet_id: Option<ApiId>,
  pub author: Option<ApiAuthor>,
  pub user: Option<ApiAuthor>,
  pub user_id: Option<ApiId>,
  pub content: Option<String>,
  pub text: Option<String>,
  pub image: Option<String>,
  pub tags: Option<ApiTags>,
  pub like_count: Option<ApiCount>,
  pub likes_count: Option<ApiCount>,
  pub likes: Option<ApiCount>,
  pub is_liked: Option<bool>,
  pub liked: Option<bool>,
  pub retweet_count: Option<ApiCount>,
  pub retweets_count: Option<ApiCount>,
  pub retweets: Option<ApiCount>,
  pub is_retweeted: Option<bool>,
  pub retweeted: Option<bool>,
  pub comment_count: Option<ApiCount>,
  pub comments_count: Option<ApiCount>,
  #[serde(default)]
  pub comments: Vec<ApiComment>,
  pub created_at: Option<String>,
}

impl ApiFeedItem {
  pub fn into_item(self) -> Result<FeedItem, TransportError> {
    let id = first_id([self.id, self.mongo_id, self.yeet_id]).ok_or_else(|| missing_id("feed item"))?;
    let (author_id, author_handle) = split_author(self.author.or(self.user), self.user_id);

    let comments: Vec<Comment> = self
      .comments
      .into_iter()
      .filter_map(|c| c.into_comment().ok())
      .collect();
    let comment_count = match first_count([self.comment_count, self.comments_count, None]) {
      0 => comments.len() as u64,
      n => n,
    };

    Ok(FeedItem {
      id,
      author_id,
      author_handle,
      content: first_text([self.content, self.text, None]).unwrap_or_default(),
      image: self.image.filter(|s| !s.is_empty()),
      tags: self.tags.map(ApiTags::into_vec).unwrap_or_default(),
      like_count: first_count([self.like_count, self.likes_count, self.likes]),
      is_liked: self.is_liked.or(self.liked).unwrap_or(false),
      retweet_count: first_count([self.retweet_count, self.retweets_count, self.retweets]),
      is_retweeted: self.is_retweeted.or(self.retweeted).unwrap_or(false),
      comment_count,
      comments,
      created_at: self.created_at,
    })
  }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNotification {
  pub id: Option<ApiId>,
  #[serde(rename = "_id")]
  pub mongo_id: Option<ApiId>,
  pub notification_id: Option<ApiId>,
  #[serde(rename = "type")]
  pub kind: Option<String>,
  pub message: Option<String>,
  pub content: Option<String>,
  pub read: Option<bool>,
  pub is_read: Option<bool>,
  pub yeet_id: Option<ApiId>,
  pub item_id: Option<ApiId>,
  pub actor_id: Option<ApiId>,
  pub from_user_id: Option<ApiId>,
  pub sender_id: Option<ApiId>,
  pub created_at: Option<String>,
}

impl ApiNotification {
  pub fn into_notification(self) -> Result<Notification, TransportError> {
    let id = first_id([self.id, self.mongo_id, self.notification_id])
      .ok_or_else(|| missing_id("notification"))?;

    Ok(Notification {
      id,
      kind: self.kind.unwrap_or_else(|| "general".to_string()),
      message: first_text([self.message, self.content, None]).unwrap_or_default(),
      read: self.read.or(self.is_read).unwrap_or(false),
      item_id: first_id([self.yeet_id, self.item_id, None]),
      actor_id: first_id([self.actor_id, self.from_user_id, self.sender_id]),
      created_at: self.created_at,
    })
  }
}

/// Unread count as a bare number, `{count}`, `{unreadCount}` or either
/// of those under `data`.
pub fn unread_count(body: &Value) -> Option<UnreadCount> {
  let scalar = |v: &Value| v.as_u64().or_else(|| v.as_i64().map(|n| n.max(0) as u64));

  let from_object = |v: &Value| {
    v.get("count")
      .or_else(|| v.get("unreadCount"))
      .and_then(scalar)
  };

  scalar(body)
    .or_else(|| from_object(body))
    .or_else(|| body.get("data").and_then(|d| scalar(d).or_else(|| from_object(d))))
    .map(|count| UnreadCount { count })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn user(value: Value) -> UserProfile {
    serde_json::from_value::<ApiUser>(value)
      .unwrap()
      .into_profile()
      .unwrap()
  }

  fn item(value: Value) -> FeedItem {
    serde_json::from_value::<ApiFeedItem>(value)
      .unwrap()
      .into_item()
      .unwrap()
  }

  #[test]
  fn test_user_aliases() {
    let a = user(json!({"id": 7, "username": "ann", "image": "a.png", "followersCount": 3}));
    assert_eq!(a.id, "7");
    assert_eq!(a.handle, "ann");
    assert_eq!(a.display_name, "ann");
    assert_eq!(a.avatar, "a.png");
    assert_eq!(a.follower_count, 3);

    let b = user(json!({"_id": "u2", "handle": "bob", "fullname": "Bob B", "avatar": "b.png"}));
    assert_eq!(b.id, "u2");
    assert_eq!(b.handle, "bob");
    assert_eq!(b.display_name, "Bob B");
    assert_eq!(b.avatar, "b.png");
  }

  #[test]
  fn test_user_fallbacks() {
    let c = user(json!({"authUserId": "u3"}));
    assert_eq!(c.handle, "u3");
    assert_eq!(c.display_name, "Unknown User");
    assert_eq!(c.avatar, "");
  }

  #[test]
  fn test_user_without_id_is_decode_error() {
    let err = serde_json::from_value::<ApiUser>(json!({"username": "x"}))
      .unwrap()
      .into_profile()
      .unwrap_err();
    assert!(matches!(err, TransportError::Decode(_)));
  }

  #[test]
  fn test_item_counts_from_numbers_or_lists() {
    let a = item(json!({"id": "1", "content": "hi", "likeCount": 2, "isLiked": true}));
    assert_eq!(a.like_count, 2);
    assert!(a.is_liked);

    let b = item(json!({"_id": "2", "text": "yo", "likes": ["u1", "u2", "u3"], "liked": false}));
    assert_eq!(b.like_count, 3);
    assert_eq!(b.content, "yo");
    assert!(!b.is_liked);

    // Negative counters from a confused backend clamp to zero
    let c = item(json!({"id": "3", "retweetCount": -1}));
    assert_eq!(c.retweet_count, 0);
  }

  #[test]
  fn test_item_author_shapes() {
    let a = item(json!({"id": "1", "author": "u9"}));
    assert_eq!(a.author_id.as_deref(), Some("u9"));
    assert_eq!(a.author_handle, None);

    let b = item(json!({"id": "2", "user": {"id": "u8", "username": "eve"}}));
    assert_eq!(b.author_id.as_deref(), Some("u8"));
    assert_eq!(b.author_handle.as_deref(), Some("eve"));
  }

  #[test]
  fn test_item_tags_and_comments() {
    let a = item(json!({
      "id": "1",
      "tags": "rust, async,,",
      "comments": [{"id": "c1", "text": "nice"}, {"text": "no id"}]
    }));
    assert_eq!(a.tags, vec!["rust", "async"]);
    assert_eq!(a.comments.len(), 1);
    assert_eq!(a.comment_count, 1);
  }

  #[test]
  fn test_notification_aliases() {
    let n = serde_json::from_value::<ApiNotification>(json!({
      "_id": "n1",
      "type": "like",
      "content": "ann liked your yeet",
      "isRead": true,
      "yeetId": 12,
      "fromUserId": "u1"
    }))
    .unwrap()
    .into_notification()
    .unwrap();

    assert_eq!(n.id, "n1");
    assert_eq!(n.kind, "like");
    assert_eq!(n.message, "ann liked your yeet");
    assert!(n.read);
    assert_eq!(n.item_id.as_deref(), Some("12"));
    assert_eq!(n.actor_id.as_deref(), Some("u1"));
  }

  #[test]
  fn test_unread_count_shapes() {
    assert_eq!(unread_count(&json!(4)), Some(UnreadCount { count: 4 }));
    assert_eq!(unread_count(&json!({"count": 2})), Some(UnreadCount { count: 2 }));
    assert_eq!(unread_count(&json!({"unreadCount": 5})), Some(UnreadCount { count: 5 }));
    assert_eq!(unread_count(&json!({"data": {"count": 1}})), Some(UnreadCount { count: 1 }));
    assert_eq!(unread_count(&json!({"nope": 1})), None);
  }
}
