//! Caching implementations for the canonical types.

use crate::cache::Entity;

use super::types::{Comment, FeedItem, Notification, UserProfile};

impl Entity for FeedItem {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "items"
  }
}

impl Entity for UserProfile {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "users"
  }
}

impl Entity for Notification {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "notifications"
  }
}

impl Entity for Comment {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "comments"
  }
}
