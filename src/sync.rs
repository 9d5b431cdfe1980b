//! Cache side effects shared by push events and mutations.
//!
//! Both pipelines describe what they want done as a [`CacheEffects`] value
//! and hand it to [`CacheEffects::apply`], so an inbound "item liked" event
//! and a local like settle the cache the same way.

use tracing::debug;

use crate::api::{FeedItem, Notification, UnreadCount};
use crate::cache::{keys, EntityCache, QueryKey};
use crate::notice::{Notice, NoticeSink};

/// A direct local change to cached data, applied under any pending
/// optimistic patches.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalUpdate {
  /// Put a notification at the head of the inbox; bumps the unread count
  /// when it is unread and not already known
  PrependNotification(Notification),
  /// Flag one notification read; drops the unread count if it was unread
  MarkNotificationRead(String),
  MarkAllNotificationsRead,
  /// Drop a notification everywhere; drops the unread count if it was unread
  RemoveNotification(String),
  /// Put an item at the head of the feed lists
  PrependItem(FeedItem),
  /// Drop an item from every list and forget its detail entry
  RemoveItem(String),
  /// Overwrite server-reported counters on an item wherever it is cached
  ItemCounts {
    id: String,
    like_count: Option<u64>,
    retweet_count: Option<u64>,
  },
}

/// Everything one event or settled mutation does to the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEffects {
  pub updates: Vec<LocalUpdate>,
  pub invalidations: Vec<QueryKey>,
  pub notice: Option<Notice>,
}

impl CacheEffects {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(mut self, update: LocalUpdate) -> Self {
    self.updates.push(update);
    self
  }

  pub fn invalidate(mut self, key: QueryKey) -> Self {
    self.invalidations.push(key);
    self
  }

  pub fn notice(mut self, notice: Notice) -> Self {
    self.notice = Some(notice);
    self
  }

  /// Local updates first, then invalidations, then the notice.
  pub fn apply(self, cache: &EntityCache, notices: &NoticeSink) {
    for update in self.updates {
      apply_update(cache, update);
    }
    for key in &self.invalidations {
      cache.invalidate(key);
    }
    if let Some(notice) = self.notice {
      notices.send(notice);
    }
  }
}

fn apply_update(cache: &EntityCache, update: LocalUpdate) {
  match update {
    LocalUpdate::PrependNotification(notification) => {
      let mut known = false;
      cache.update_lists::<Notification, _>(&keys::notifications::lists(), |list| {
        if list.iter().any(|n| n.id == notification.id) {
          known = true;
        } else {
          list.insert(0, notification.clone());
        }
      });
      if !known && !notification.read {
        adjust_unread(cache, UnreadCount::increment);
      }
    }
    LocalUpdate::MarkNotificationRead(id) => {
      let mut was_unread = false;
      cache.update_lists::<Notification, _>(&keys::notifications::lists(), |list| {
        for n in list.iter_mut().filter(|n| n.id == id && !n.read) {
          n.read = true;
          was_unread = true;
        }
      });
      if was_unread {
        adjust_unread(cache, UnreadCount::decrement);
      }
    }
    LocalUpdate::MarkAllNotificationsRead => {
      cache.update_lists::<Notification, _>(&keys::notifications::lists(), |list| {
        list.iter_mut().for_each(|n| n.read = true);
      });
      cache.update(&keys::notifications::unread_count(), |count: Option<UnreadCount>| {
        count.map(|_| UnreadCount::default())
      });
    }
    LocalUpdate::RemoveNotification(id) => {
      let mut was_unread = false;
      cache.update_lists::<Notification, _>(&keys::notifications::lists(), |list| {
        if list.iter().any(|n| n.id == id && !n.read) {
          was_unread = true;
        }
        list.retain(|n| n.id != id);
      });
      if was_unread {
        adjust_unread(cache, UnreadCount::decrement);
      }
    }
    LocalUpdate::PrependItem(item) => {
      for key in [keys::items::feed(), keys::items::timeline()] {
        cache.update_lists::<FeedItem, _>(&key, |list| {
          if !list.iter().any(|i| i.id == item.id) {
            list.insert(0, item.clone());
          }
        });
      }
    }
    LocalUpdate::RemoveItem(id) => {
      let lists = cache.update_lists::<FeedItem, _>(&keys::items::lists(), |list| {
        list.retain(|i| i.id != id);
      });
      cache.remove(&keys::items::detail(&id));
      debug!(item = %id, lists, "Item removed from cache");
    }
    LocalUpdate::ItemCounts {
      id,
      like_count,
      retweet_count,
    } => {
      let set_counts = |item: &mut FeedItem| {
        if let Some(n) = like_count {
          item.like_count = n;
        }
        if let Some(n) = retweet_count {
          item.retweet_count = n;
        }
      };
      cache.update_lists::<FeedItem, _>(&keys::items::lists(), |list| {
        list.iter_mut().filter(|i| i.id == id).for_each(&set_counts);
      });
      cache.update(&keys::items::detail(&id), |item: Option<FeedItem>| {
        item.map(|mut item| {
          set_counts(&mut item);
          item
        })
      });
    }
  }
}

/// Counters only move when cached; a missing count is fetched fresh later.
fn adjust_unread(cache: &EntityCache, f: fn(UnreadCount) -> UnreadCount) {
  cache.update(&keys::notifications::unread_count(), |count: Option<UnreadCount>| {
    count.map(f)
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryStatus;
  use crate::notice::drain;
  use std::time::Duration;

  fn note(id: &str, read: bool) -> Notification {
    Notification {
      id: id.into(),
      kind: "like".into(),
      message: format!("note {}", id),
      read,
      item_id: None,
      actor_id: None,
      created_at: None,
    }
  }

  fn item(id: &str) -> FeedItem {
    FeedItem {
      id: id.into(),
      author_id: None,
      author_handle: None,
      content: String::new(),
      image: None,
      tags: Vec::new(),
      like_count: 0,
      is_liked: false,
      retweet_count: 0,
      is_retweeted: false,
      comment_count: 0,
      comments: Vec::new(),
      created_at: None,
    }
  }

  fn seeded() -> EntityCache {
    let cache = EntityCache::new(Duration::from_secs(60));
    cache.set(&keys::notifications::inbox(), &vec![note("1", false), note("2", true)], None);
    cache.set(&keys::notifications::unread_count(), &UnreadCount { count: 1 }, None);
    cache
  }

  fn unread(cache: &EntityCache) -> u64 {
    cache
      .get_data::<UnreadCount>(&keys::notifications::unread_count())
      .unwrap()
      .count
  }

  #[test]
  fn test_prepend_notification_counts_once() {
    let cache = seeded();
    let (sink, mut rx) = NoticeSink::channel();

    let effects = CacheEffects::new()
      .update(LocalUpdate::PrependNotification(note("3", false)))
      .notice(Notice::Push("note 3".into()));
    effects.clone().apply(&cache, &sink);
    effects.apply(&cache, &sink);

    let inbox: Vec<Notification> = cache.get_data(&keys::notifications::inbox()).unwrap();
    assert_eq!(inbox.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["3", "1", "2"]);
    assert_eq!(unread(&cache), 2);
    assert_eq!(drain(&mut rx).len(), 2);
  }

  #[test]
  fn test_read_and_remove_clamp_unread_at_zero() {
    let cache = seeded();
    let sink = NoticeSink::discard();

    CacheEffects::new()
      .update(LocalUpdate::MarkNotificationRead("1".into()))
      .apply(&cache, &sink);
    assert_eq!(unread(&cache), 0);

    // Already read: no further decrement
    CacheEffects::new()
      .update(LocalUpdate::MarkNotificationRead("1".into()))
      .update(LocalUpdate::RemoveNotification("2".into()))
      .apply(&cache, &sink);
    assert_eq!(unread(&cache), 0);
    let inbox: Vec<Notification> = cache.get_data(&keys::notifications::inbox()).unwrap();
    assert_eq!(inbox.len(), 1);
  }

  #[test]
  fn test_mark_all_read() {
    let cache = seeded();
    CacheEffects::new()
      .update(LocalUpdate::MarkAllNotificationsRead)
      .apply(&cache, &NoticeSink::discard());
    let inbox: Vec<Notification> = cache.get_data(&keys::notifications::inbox()).unwrap();
    assert!(inbox.iter().all(|n| n.read));
    assert_eq!(unread(&cache), 0);
  }

  #[test]
  fn test_remove_item_everywhere() {
    let cache = EntityCache::new(Duration::from_secs(60));
    cache.set(&keys::items::feed(), &vec![item("1"), item("2")], None);
    cache.set(&keys::items::by_user("u1"), &vec![item("2")], None);
    cache.set(&keys::items::detail("2"), &item("2"), None);

    CacheEffects::new()
      .update(LocalUpdate::RemoveItem("2".into()))
      .apply(&cache, &NoticeSink::discard());

    let feed: Vec<FeedItem> = cache.get_data(&keys::items::feed()).unwrap();
    assert_eq!(feed.len(), 1);
    let mine: Vec<FeedItem> = cache.get_data(&keys::items::by_user("u1")).unwrap();
    assert!(mine.is_empty());
    assert!(!cache.contains(&keys::items::detail("2")));
  }

  #[test]
  fn test_item_counts_and_invalidation() {
    let cache = EntityCache::new(Duration::from_secs(60));
    cache.set(&keys::items::feed(), &vec![item("1")], None);
    cache.set(&keys::items::detail("1"), &item("1"), None);

    CacheEffects::new()
      .update(LocalUpdate::ItemCounts {
        id: "1".into(),
        like_count: Some(4),
        retweet_count: None,
      })
      .invalidate(keys::items::detail("1"))
      .apply(&cache, &NoticeSink::discard());

    let detail = cache.get(&keys::items::detail("1")).unwrap();
    assert_eq!(detail.status, EntryStatus::Stale);
    assert_eq!(detail.decode::<FeedItem>().unwrap().like_count, 4);
    let feed: Vec<FeedItem> = cache.get_data(&keys::items::feed()).unwrap();
    assert_eq!(feed[0].like_count, 4);
  }

  #[test]
  fn test_prepend_item_skips_missing_lists() {
    let cache = EntityCache::new(Duration::from_secs(60));
    cache.set(&keys::items::feed(), &vec![item("1")], None);

    CacheEffects::new()
      .update(LocalUpdate::PrependItem(item("9")))
      .apply(&cache, &NoticeSink::discard());

    let feed: Vec<FeedItem> = cache.get_data(&keys::items::feed()).unwrap();
    assert_eq!(feed[0].id, "9");
    assert!(!cache.contains(&keys::items::timeline()));
  }
}
