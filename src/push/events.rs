//! Typed push events and the server-sent-events frame decoder.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::api_types::{ApiCount, ApiId};
use crate::api::envelope;
use crate::api::{FeedItem, Notification};
use crate::cache::keys;
use crate::notice::Notice;
use crate::sync::{CacheEffects, LocalUpdate};

/// Every event the push channel delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
  NotificationCreated(Notification),
  NotificationRead {
    id: String,
  },
  NotificationDeleted {
    id: String,
  },
  ItemLiked {
    item_id: String,
    user_id: Option<String>,
    like_count: Option<u64>,
  },
  ItemRetweeted {
    item_id: String,
    user_id: Option<String>,
    retweet_count: Option<u64>,
  },
  UserFollowed {
    follower_id: Option<String>,
    followee_id: Option<String>,
  },
  ItemCreated(FeedItem),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventRef {
  id: Option<ApiId>,
  notification_id: Option<ApiId>,
  yeet_id: Option<ApiId>,
  user_id: Option<ApiId>,
  follower_id: Option<ApiId>,
  followee_id: Option<ApiId>,
  following_id: Option<ApiId>,
  like_count: Option<ApiCount>,
  likes: Option<ApiCount>,
  retweet_count: Option<ApiCount>,
  retweets: Option<ApiCount>,
}

fn id_of(id: Option<ApiId>) -> Option<String> {
  id.map(ApiId::into_string).filter(|s| !s.is_empty())
}

impl PushEvent {
  /// Decode one event by its wire name. Unknown names and payloads that
  /// do not carry the required ids yield `None`.
  pub fn parse(name: &str, data: Value) -> Option<Self> {
    let event = match name {
      "notification" => envelope::NOTIFICATION
        .decode(data, envelope::notification)
        .map(PushEvent::NotificationCreated)
        .map_err(|e| warn!(event = name, "Bad push payload: {}", e))
        .ok(),
      "yeet_created" => envelope::ITEM
        .decode(data, envelope::feed_item)
        .map(PushEvent::ItemCreated)
        .map_err(|e| warn!(event = name, "Bad push payload: {}", e))
        .ok(),
      "notification_read" | "notification_deleted" | "yeet_liked" | "yeet_retweeted"
      | "user_followed" => {
        let r: ApiEventRef = serde_json::from_value(data)
          .map_err(|e| warn!(event = name, "Bad push payload: {}", e))
          .ok()?;
        Self::from_ref(name, r)
      }
      _ => {
        debug!(event = name, "Ignoring unknown push event");
        None
      }
    };
    event
  }

  fn from_ref(name: &str, r: ApiEventRef) -> Option<Self> {
    match name {
      "notification_read" => Some(PushEvent::NotificationRead {
        id: id_of(r.notification_id.or(r.id))?,
      }),
      "notification_deleted" => Some(PushEvent::NotificationDeleted {
        id: id_of(r.notification_id.or(r.id))?,
      }),
      "yeet_liked" => Some(PushEvent::ItemLiked {
        item_id: id_of(r.yeet_id.or(r.id))?,
        user_id: id_of(r.user_id),
        like_count: r.like_count.or(r.likes).map(|c| c.value()),
      }),
      "yeet_retweeted" => Some(PushEvent::ItemRetweeted {
        item_id: id_of(r.yeet_id.or(r.id))?,
        user_id: id_of(r.user_id),
        retweet_count: r.retweet_count.or(r.retweets).map(|c| c.value()),
      }),
      "user_followed" => Some(PushEvent::UserFollowed {
        follower_id: id_of(r.follower_id.or(r.user_id)),
        followee_id: id_of(r.followee_id.or(r.following_id)),
      }),
      _ => None,
    }
  }

  /// What this event does to the cache.
  pub fn effects(&self) -> CacheEffects {
    match self {
      PushEvent::NotificationCreated(n) => {
        let message = if n.message.is_empty() {
          "New notification".to_string()
        } else {
          n.message.clone()
        };
        CacheEffects::new()
          .update(LocalUpdate::PrependNotification(n.clone()))
          .invalidate(keys::notifications::unread_count())
          .invalidate(keys::notifications::lists())
          .notice(Notice::Push(message))
      }
      PushEvent::NotificationRead { id } => CacheEffects::new()
        .update(LocalUpdate::MarkNotificationRead(id.clone()))
        .invalidate(keys::notifications::unread_count()),
      PushEvent::NotificationDeleted { id } => CacheEffects::new()
        .update(LocalUpdate::RemoveNotification(id.clone()))
        .invalidate(keys::notifications::unread_count())
        .invalidate(keys::notifications::lists()),
      PushEvent::ItemLiked {
        item_id, like_count, ..
      } => item_counts(item_id, *like_count, None),
      PushEvent::ItemRetweeted {
        item_id,
        retweet_count,
        ..
      } => item_counts(item_id, None, *retweet_count),
      PushEvent::UserFollowed {
        follower_id,
        followee_id,
      } => {
        let mut effects = CacheEffects::new().invalidate(keys::users::me());
        for id in [follower_id, followee_id].into_iter().flatten() {
          effects = effects
            .invalidate(keys::users::detail(id))
            .invalidate(keys::users::followers(id))
            .invalidate(keys::users::following(id));
        }
        effects
      }
      PushEvent::ItemCreated(item) => CacheEffects::new()
        .update(LocalUpdate::PrependItem(item.clone()))
        .invalidate(keys::items::lists()),
    }
  }
}

fn item_counts(item_id: &str, like_count: Option<u64>, retweet_count: Option<u64>) -> CacheEffects {
  let mut effects = CacheEffects::new();
  if like_count.is_some() || retweet_count.is_some() {
    effects = effects.update(LocalUpdate::ItemCounts {
      id: item_id.to_string(),
      like_count,
      retweet_count,
    });
  }
  effects
    .invalidate(keys::items::detail(item_id))
    .invalidate(keys::items::lists())
}

/// One dispatched server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
  pub event: String,
  pub data: String,
}

impl SseFrame {
  /// Typed event, if this frame carries one we understand. Unnamed frames
  /// may wrap the name inside the payload as `{type|event, data|payload}`.
  pub fn into_event(self) -> Option<PushEvent> {
    let data: Value = match serde_json::from_str(&self.data) {
      Ok(v) => v,
      Err(e) => {
        warn!(event = %self.event, "Push frame is not JSON: {}", e);
        return None;
      }
    };

    if self.event == "message" {
      let name = data
        .get("type")
        .or_else(|| data.get("event"))
        .and_then(Value::as_str)?
        .to_string();
      let payload = data
        .get("data")
        .or_else(|| data.get("payload"))
        .cloned()
        .unwrap_or(Value::Null);
      return PushEvent::parse(&name, payload);
    }
    PushEvent::parse(&self.event, data)
  }
}

/// Incremental `text/event-stream` decoder. Feed it chunks as they arrive;
/// frames split across chunks are reassembled.
#[derive(Debug, Default)]
pub struct SseDecoder {
  buffer: Vec<u8>,
  event: Option<String>,
  data: Vec<String>,
}

impl SseDecoder {
  pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
    self.buffer.extend_from_slice(chunk);

    let mut frames = Vec::new();
    // Only complete lines are decoded, so a character split across chunks
    // stays intact
    while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
      let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
      let line = String::from_utf8_lossy(&raw);
      let line = line.trim_end_matches(['\n', '\r']);

      if line.is_empty() {
        if let Some(frame) = self.dispatch() {
          frames.push(frame);
        }
        continue;
      }
      if line.starts_with(':') {
        continue;
      }

      let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
      };
      match field {
        "event" => self.event = Some(value.to_string()),
        "data" => self.data.push(value.to_string()),
        // id and retry are not used
        _ => {}
      }
    }
    frames
  }

  fn dispatch(&mut self) -> Option<SseFrame> {
    let event = self.event.take();
    if self.data.is_empty() {
      return None;
    }
    let data = std::mem::take(&mut self.data).join("\n");
    Some(SseFrame {
      event: event.unwrap_or_else(|| "message".to_string()),
      data,
    })
  }
}
