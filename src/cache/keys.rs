//! Query keys and the key families used across the crate.

use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered tuple identifying a cached resource. Keys that share a prefix
/// form a family that can be invalidated together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
  pub fn new<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Extend with one more segment.
  pub fn child(&self, part: impl Into<String>) -> Self {
    let mut parts = self.0.clone();
    parts.push(part.into());
    Self(parts)
  }

  /// Extend with a stable hash of list filters, so logically equal filter
  /// sets land on the same key regardless of order or case.
  pub fn with_filters(&self, filters: &[(&str, &str)]) -> Self {
    if filters.is_empty() {
      return self.clone();
    }
    self.child(filter_hash(filters))
  }

  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  pub fn segments(&self) -> &[String] {
    &self.0
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join(":"))
  }
}

fn filter_hash(filters: &[(&str, &str)]) -> String {
  let mut normalized: Vec<String> = filters
    .iter()
    .map(|(k, v)| format!("{}={}", k.trim().to_lowercase(), v.trim().to_lowercase()))
    .collect();
  normalized.sort();

  let mut hasher = Sha256::new();
  hasher.update(normalized.join("&").as_bytes());
  // 16 hex chars is plenty to keep families apart
  hex::encode(hasher.finalize())[..16].to_string()
}

/// Feed item keys.
pub mod items {
  use super::QueryKey;

  pub fn all() -> QueryKey {
    QueryKey::new(["items"])
  }

  /// Every list that can contain items.
  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn feed() -> QueryKey {
    lists().child("feed")
  }

  pub fn timeline() -> QueryKey {
    lists().child("all")
  }

  pub fn by_user(user_id: &str) -> QueryKey {
    lists().child("user").child(user_id)
  }

  pub fn search(query: &str) -> QueryKey {
    lists().child("search").with_filters(&[("q", query)])
  }

  pub fn details() -> QueryKey {
    all().child("detail")
  }

  pub fn detail(id: &str) -> QueryKey {
    details().child(id)
  }
}

/// User keys.
pub mod users {
  use super::QueryKey;

  pub fn all() -> QueryKey {
    QueryKey::new(["users"])
  }

  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn search(query: Option<&str>) -> QueryKey {
    match query {
      Some(q) if !q.is_empty() => lists().child("search").with_filters(&[("q", q)]),
      _ => lists().child("search"),
    }
  }

  pub fn followers(user_id: &str) -> QueryKey {
    lists().child("followers").child(user_id)
  }

  pub fn following(user_id: &str) -> QueryKey {
    lists().child("following").child(user_id)
  }

  pub fn detail(id: &str) -> QueryKey {
    all().child("detail").child(id)
  }

  pub fn me() -> QueryKey {
    all().child("me")
  }
}

/// Notification keys.
pub mod notifications {
  use super::QueryKey;

  pub fn all() -> QueryKey {
    QueryKey::new(["notifications"])
  }

  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn inbox() -> QueryKey {
    lists().child("inbox")
  }

  pub fn unread_count() -> QueryKey {
    all().child("unread")
  }
}
