use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{step, MutationContext, Outcome};
use crate::api::{Comment, FeedItem, ItemUpdate, NewItem, TEMP_ID_PREFIX};
use crate::cache::{keys, PatchSet, QueryKey};
use crate::error::MutationError;
use crate::sync::{CacheEffects, LocalUpdate};

/// Create, edit, delete and react to feed items.
#[derive(Clone)]
pub struct ItemMutations {
  ctx: MutationContext,
}

impl ItemMutations {
  pub(crate) fn new(ctx: MutationContext) -> Self {
    Self { ctx }
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Post a new item. A placeholder with a temporary id heads the feed
  /// lists until the server answers; it is then swapped for the canonical
  /// item, so only one copy ever remains.
  #[instrument(skip(self, item))]
  pub async fn create(&self, item: NewItem) -> Result<FeedItem, MutationError> {
    let placeholder = FeedItem {
      id: format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()),
      author_id: self.ctx.api.transport().session().user_id(),
      author_handle: None,
      content: item.content.clone(),
      image: item.image.clone(),
      tags: item.tags.clone(),
      like_count: 0,
      is_liked: false,
      retweet_count: 0,
      is_retweeted: false,
      comment_count: 0,
      comments: Vec::new(),
      created_at: Some(Utc::now().to_rfc3339()),
    };
    debug!(temp = %placeholder.id, "Posting item");

    let patches = self
      .prepend(keys::items::feed(), placeholder.clone())
      .join(self.prepend(keys::items::timeline(), placeholder));

    let result = self.ctx.api.create_item(&item).await;
    // The placeholder goes either way
    patches.rollback();

    let mut effects = CacheEffects::new().invalidate(keys::items::lists());
    if let Ok(created) = &result {
      self
        .ctx
        .cache
        .set(&keys::items::detail(&created.id), created, Some(self.ctx.detail_ttl));
      effects = effects.update(LocalUpdate::PrependItem(created.clone()));
    }
    self.ctx.settle(
      result,
      effects,
      Outcome::loud("Yeet posted successfully!", "Failed to post yeet"),
    )
  }

  #[instrument(skip(self, update))]
  pub async fn update(&self, id: &str, update: ItemUpdate) -> Result<FeedItem, MutationError> {
    self.ctx.require(id, "Item id")?;

    let edit = update.clone();
    let patches = self.patch_item(id, move |item| {
      if let Some(content) = &edit.content {
        item.content = content.clone();
      }
      if let Some(image) = &edit.image {
        item.image = Some(image.clone());
      }
      if let Some(tags) = &edit.tags {
        item.tags = tags.clone();
      }
    });

    let result = self.ctx.api.update_item(id, &update).await;
    patches.settle(&result);
    if let Ok(updated) = &result {
      self
        .ctx
        .cache
        .set(&keys::items::detail(id), updated, Some(self.ctx.detail_ttl));
    }

    self.ctx.settle(
      result,
      CacheEffects::new().invalidate(keys::items::lists()),
      Outcome::loud("Yeet updated successfully!", "Failed to update yeet"),
    )
  }

  /// Delete an item. On success it leaves every list, not just its detail.
  #[instrument(skip(self))]
  pub async fn delete(&self, id: &str) -> Result<(), MutationError> {
    self.ctx.require(id, "Item id")?;

    let result = self.ctx.api.delete_item(id).await;
    let effects = CacheEffects::new()
      .update(LocalUpdate::RemoveItem(id.to_string()))
      .invalidate(keys::items::lists());
    self.ctx.settle(
      result,
      effects,
      Outcome::loud("Yeet deleted successfully!", "Failed to delete yeet"),
    )
  }

  // ==========================================================================
  // Reactions
  // ==========================================================================

  /// Like or unlike, depending on what the cache shows. Returns whether the
  /// item is now liked.
  #[instrument(skip(self))]
  pub async fn toggle_like(&self, id: &str) -> Result<bool, MutationError> {
    self.ctx.require(id, "Item id")?;

    let like = !self.visible_item(id).is_some_and(|i| i.is_liked);
    let patches = self.patch_item(id, move |item| {
      if item.is_liked != like {
        item.is_liked = like;
        item.like_count = step(item.like_count, like);
      }
    });

    let result = if like {
      self.ctx.api.like_item(id).await
    } else {
      self.ctx.api.unlike_item(id).await
    };
    patches.settle(&result);

    let failure = if like {
      "Failed to like yeet"
    } else {
      "Failed to unlike yeet"
    };
    self
      .ctx
      .settle(result, self.settled(id), Outcome::quiet(failure))
      .map(|_| like)
  }

  /// Retweet or undo a retweet. Returns whether the item is now retweeted.
  #[instrument(skip(self, comment))]
  pub async fn toggle_retweet(&self, id: &str, comment: Option<&str>) -> Result<bool, MutationError> {
    self.ctx.require(id, "Item id")?;

    let retweet = !self.visible_item(id).is_some_and(|i| i.is_retweeted);
    let patches = self.patch_item(id, move |item| {
      if item.is_retweeted != retweet {
        item.is_retweeted = retweet;
        item.retweet_count = step(item.retweet_count, retweet);
      }
    });

    let result = if retweet {
      self.ctx.api.retweet_item(id, comment).await
    } else {
      self.ctx.api.unretweet_item(id).await
    };
    patches.settle(&result);

    let outcome = if retweet {
      Outcome::loud("Retweet done", "Failed to retweet")
    } else {
      Outcome::loud("Retweet removed", "Failed to unretweet")
    };
    self
      .ctx
      .settle(result, self.settled(id), outcome)
      .map(|_| retweet)
  }

  // ==========================================================================
  // Comments
  // ==========================================================================

  #[instrument(skip(self, text))]
  pub async fn add_comment(&self, item_id: &str, text: &str) -> Result<Comment, MutationError> {
    self.ctx.require(item_id, "Item id")?;

    let placeholder = Comment {
      id: format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()),
      item_id: Some(item_id.to_string()),
      author_id: self.ctx.api.transport().session().user_id(),
      author_handle: None,
      text: text.to_string(),
      created_at: Some(Utc::now().to_rfc3339()),
    };
    let patches = self.patch_item(item_id, move |item| with_comment(item, &placeholder));

    let result = self.ctx.api.add_comment(item_id, text).await;
    patches.rollback();
    if let Ok(comment) = &result {
      let comment = comment.clone();
      self.edit_item(item_id, move |item| with_comment(item, &comment));
    }

    self.ctx.settle(
      result,
      CacheEffects::new().invalidate(keys::items::detail(item_id)),
      Outcome::loud("Your reply has been added", "Failed to add comment"),
    )
  }

  #[instrument(skip(self))]
  pub async fn delete_comment(&self, item_id: &str, comment_id: &str) -> Result<(), MutationError> {
    self.ctx.require(item_id, "Item id")?;
    self.ctx.require(comment_id, "Comment id")?;

    let target = comment_id.to_string();
    let patches = self.patch_item(item_id, move |item| {
      let before = item.comments.len();
      item.comments.retain(|c| c.id != target);
      if item.comments.len() < before {
        item.comment_count = item.comment_count.saturating_sub(1);
      }
    });

    let result = self.ctx.api.delete_comment(comment_id).await;
    patches.settle(&result);

    self.ctx.settle(
      result,
      CacheEffects::new().invalidate(keys::items::detail(item_id)),
      Outcome::loud("Your comment has been deleted", "Failed to delete comment"),
    )
  }

  // ==========================================================================
  // Cache plumbing
  // ==========================================================================

  /// Entries to refresh once a reaction settles.
  fn settled(&self, id: &str) -> CacheEffects {
    CacheEffects::new()
      .invalidate(keys::items::detail(id))
      .invalidate(keys::items::lists())
  }

  /// The item as currently shown, from its detail entry or any list.
  fn visible_item(&self, id: &str) -> Option<FeedItem> {
    let cache = &self.ctx.cache;
    cache.get_data(&keys::items::detail(id)).or_else(|| {
      cache
        .keys(&keys::items::lists())
        .into_iter()
        .filter_map(|key| cache.get_data::<Vec<FeedItem>>(&key))
        .find_map(|list| list.into_iter().find(|i| i.id == id))
    })
  }

  /// Patch the item wherever it is cached.
  fn patch_item<F>(&self, id: &str, edit: F) -> PatchSet
  where
    F: Fn(&mut FeedItem) + Send + Sync + 'static,
  {
    let edit = Arc::new(edit);
    let in_detail = Arc::clone(&edit);
    let target = id.to_string();

    self
      .ctx
      .cache
      .patch(&keys::items::detail(id), move |item: Option<FeedItem>| {
        item.map(|mut item| {
          in_detail(&mut item);
          item
        })
      })
      .join(
        self
          .ctx
          .cache
          .patch_lists(&keys::items::lists(), move |list: &mut Vec<FeedItem>| {
            list.iter_mut().filter(|i| i.id == target).for_each(|i| edit(i));
          }),
      )
  }

  /// Confirmed local edit of the item wherever it is cached.
  fn edit_item<F>(&self, id: &str, edit: F)
  where
    F: Fn(&mut FeedItem),
  {
    self.ctx.cache.update(&keys::items::detail(id), |item: Option<FeedItem>| {
      item.map(|mut item| {
        edit(&mut item);
        item
      })
    });
    self
      .ctx
      .cache
      .update_lists::<FeedItem, _>(&keys::items::lists(), |list| {
        list.iter_mut().filter(|i| i.id == id).for_each(&edit);
      });
  }

  fn prepend(&self, key: QueryKey, item: FeedItem) -> PatchSet {
    self.ctx.cache.patch(&key, move |list: Option<Vec<FeedItem>>| {
      list.map(|mut list| {
        list.insert(0, item.clone());
        list
      })
    })
  }
}

fn with_comment(item: &mut FeedItem, comment: &Comment) {
  if !item.comments.iter().any(|c| c.id == comment.id) {
    item.comments.push(comment.clone());
    item.comment_count = item.comment_count.saturating_add(1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mutations::testing::Harness;
  use crate::notice::Notice;
  use crate::transport::testing::{ok, refused, status, ScriptedBackend};
  use serde_json::json;
  use std::time::Duration;

  fn item(id: &str, likes: u64, liked: bool) -> FeedItem {
    FeedItem {
      id: id.into(),
      author_id: Some("u1".into()),
      author_handle: Some("ann".into()),
      content: format!("post {}", id),
      image: None,
      tags: Vec::new(),
      like_count: likes,
      is_liked: liked,
      retweet_count: 0,
      is_retweeted: false,
      comment_count: 0,
      comments: Vec::new(),
      created_at: None,
    }
  }

  fn feed(h: &Harness) -> Vec<FeedItem> {
    h.cache.get_data(&keys::items::feed()).unwrap()
  }

  #[tokio::test]
  async fn test_failed_like_restores_exact_state() {
    let mut h = Harness::new(ScriptedBackend::new(|_| refused()).with_delay(Duration::from_millis(20)));
    h.cache.set(&keys::items::feed(), &vec![item("1", 0, false)], None);
    h.cache.set(&keys::items::detail("1"), &item("1", 0, false), None);
    let mutations = ItemMutations::new(h.ctx.clone());

    let pending = tokio::spawn({
      let mutations = mutations.clone();
      async move { mutations.toggle_like("1").await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let shown: FeedItem = h.cache.get_data(&keys::items::detail("1")).unwrap();
    assert!(shown.is_liked);
    assert_eq!(shown.like_count, 1);
    assert_eq!(feed(&h)[0].like_count, 1);

    assert!(pending.await.unwrap().is_err());
    let detail: FeedItem = h.cache.get_data(&keys::items::detail("1")).unwrap();
    assert_eq!(detail, item("1", 0, false));
    assert_eq!(feed(&h)[0], item("1", 0, false));
    assert_eq!(h.notices(), vec![Notice::MutationFailed("Failed to like yeet".into())]);
  }

  #[tokio::test]
  async fn test_unlike_clamps_at_zero_and_invalidates() {
    let mut h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    h.cache.set(&keys::items::detail("1"), &item("1", 0, true), None);
    let mutations = ItemMutations::new(h.ctx.clone());

    assert!(!mutations.toggle_like("1").await.unwrap());
    let entry = h.cache.get(&keys::items::detail("1")).unwrap();
    assert_eq!(entry.decode::<FeedItem>().unwrap().like_count, 0);
    assert_eq!(entry.status, crate::cache::EntryStatus::Stale);
    assert_eq!(h.backend.count("DELETE", "/yeets/1/like"), 1);
    assert!(h.notices().is_empty());
  }

  #[tokio::test]
  async fn test_missing_id_is_rejected_before_sending() {
    let mut h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    let mutations = ItemMutations::new(h.ctx.clone());

    let err = mutations.toggle_like(" ").await.unwrap_err();
    assert!(matches!(err, MutationError::Validation(_)));
    assert!(h.backend.requests().is_empty());
    assert_eq!(h.notices().len(), 1);
  }

  #[tokio::test]
  async fn test_create_swaps_placeholder_for_canonical_item() {
    let h = Harness::new(
      ScriptedBackend::new(|_| ok(json!({"yeet": {"_id": "42", "content": "hello"}})))
        .with_delay(Duration::from_millis(20)),
    );
    h.cache.set(&keys::items::feed(), &vec![item("1", 0, false)], None);
    let mutations = ItemMutations::new(h.ctx.clone());

    let pending = tokio::spawn({
      let mutations = mutations.clone();
      async move {
        mutations
          .create(NewItem {
            content: "hello".into(),
            ..Default::default()
          })
          .await
      }
    });
    while feed(&h).len() < 2 {
      tokio::task::yield_now().await;
    }
    assert!(feed(&h)[0].is_temporary());
    assert_eq!(feed(&h)[0].content, "hello");

    let created = pending.await.unwrap().unwrap();
    assert_eq!(created.id, "42");
    let ids: Vec<String> = feed(&h).into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["42", "1"]);
    assert!(h.cache.contains(&keys::items::detail("42")));
  }

  #[tokio::test]
  async fn test_failed_create_leaves_no_placeholder() {
    let mut h = Harness::new(ScriptedBackend::new(|_| {
      Ok(crate::transport::HttpResponse::new(422, json!({"message": "Content too long"})))
    }));
    h.cache.set(&keys::items::feed(), &vec![item("1", 0, false)], None);
    let mutations = ItemMutations::new(h.ctx.clone());

    let err = mutations
      .create(NewItem {
        content: "x".repeat(500),
        ..Default::default()
      })
      .await
      .unwrap_err();
    assert!(matches!(err, MutationError::Transport(_)));
    assert_eq!(feed(&h), vec![item("1", 0, false)]);
    assert_eq!(h.notices(), vec![Notice::MutationFailed("Content too long".into())]);
  }

  #[tokio::test]
  async fn test_delete_removes_from_every_list() {
    let mut h = Harness::new(ScriptedBackend::new(|_| status(204)));
    h.cache.set(&keys::items::feed(), &vec![item("1", 0, false), item("2", 0, false)], None);
    h.cache.set(&keys::items::by_user("u1"), &vec![item("2", 0, false)], None);
    h.cache.set(&keys::items::detail("2"), &item("2", 0, false), None);
    let mutations = ItemMutations::new(h.ctx.clone());

    mutations.delete("2").await.unwrap();

    assert_eq!(feed(&h).len(), 1);
    let mine: Vec<FeedItem> = h.cache.get_data(&keys::items::by_user("u1")).unwrap();
    assert!(mine.is_empty());
    assert!(!h.cache.contains(&keys::items::detail("2")));
    assert_eq!(
      h.notices(),
      vec![Notice::MutationSucceeded("Yeet deleted successfully!".into())]
    );
  }

  #[tokio::test]
  async fn test_add_comment_keeps_only_canonical_comment() {
    let h = Harness::new(ScriptedBackend::new(|_| {
      ok(json!({"comment": {"_id": "c9", "text": "nice"}}))
    }));
    h.cache.set(&keys::items::detail("1"), &item("1", 0, false), None);
    let mutations = ItemMutations::new(h.ctx.clone());

    let comment = mutations.add_comment("1", "nice").await.unwrap();
    assert_eq!(comment.id, "c9");

    let detail: FeedItem = h.cache.get_data(&keys::items::detail("1")).unwrap();
    assert_eq!(detail.comment_count, 1);
    assert_eq!(detail.comments.len(), 1);
    assert_eq!(detail.comments[0].id, "c9");
  }

  #[tokio::test]
  async fn test_retweet_toggle_sends_comment() {
    let h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    h.cache.set(&keys::items::feed(), &vec![item("1", 0, false)], None);
    let mutations = ItemMutations::new(h.ctx.clone());

    assert!(mutations.toggle_retweet("1", Some("look")).await.unwrap());
    let request = h.backend.requests().pop().unwrap();
    assert_eq!(request.path, "/yeets/1/retweet");
    assert_eq!(request.body, Some(json!({"comment": "look"})));
    assert_eq!(feed(&h)[0].retweet_count, 1);
    assert!(feed(&h)[0].is_retweeted);
  }
}
