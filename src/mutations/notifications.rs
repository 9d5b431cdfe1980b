use tracing::instrument;

use super::{MutationContext, Outcome};
use crate::api::{Notification, UnreadCount};
use crate::cache::{keys, PatchSet};
use crate::error::MutationError;
use crate::sync::CacheEffects;

#[derive(Clone)]
pub struct NotificationMutations {
  ctx: MutationContext,
}

impl NotificationMutations {
  pub(crate) fn new(ctx: MutationContext) -> Self {
    Self { ctx }
  }

  #[instrument(skip(self))]
  pub async fn mark_read(&self, id: &str) -> Result<(), MutationError> {
    self.ctx.require(id, "Notification id")?;

    let was_unread = self.is_unread(id);
    let target = id.to_string();
    let mut patches = self.ctx.cache.patch_lists(
      &keys::notifications::lists(),
      move |list: &mut Vec<Notification>| {
        for n in list.iter_mut().filter(|n| n.id == target) {
          n.read = true;
        }
      },
    );
    if was_unread {
      patches = patches.join(self.adjust_unread(UnreadCount::decrement));
    }

    let result = self.ctx.api.mark_read(id).await;
    patches.settle(&result);

    self
      .ctx
      .settle(
        result,
        self.settled(),
        Outcome::quiet("Failed to mark notification as read"),
      )
      .map(|_| ())
  }

  #[instrument(skip(self))]
  pub async fn mark_all_read(&self) -> Result<(), MutationError> {
    let patches = self
      .ctx
      .cache
      .patch_lists(&keys::notifications::lists(), |list: &mut Vec<Notification>| {
        list.iter_mut().for_each(|n| n.read = true);
      })
      .join(self.adjust_unread(|_| UnreadCount::default()));

    let result = self.ctx.api.mark_all_read().await;
    patches.settle(&result);

    self.ctx.settle(
      result,
      self.settled(),
      Outcome::loud(
        "All notifications marked as read",
        "Failed to mark all notifications as read",
      ),
    )
  }

  #[instrument(skip(self))]
  pub async fn delete(&self, id: &str) -> Result<(), MutationError> {
    self.ctx.require(id, "Notification id")?;

    let was_unread = self.is_unread(id);
    let target = id.to_string();
    let mut patches = self.ctx.cache.patch_lists(
      &keys::notifications::lists(),
      move |list: &mut Vec<Notification>| list.retain(|n| n.id != target),
    );
    if was_unread {
      patches = patches.join(self.adjust_unread(UnreadCount::decrement));
    }

    let result = self.ctx.api.delete_notification(id).await;
    patches.settle(&result);

    self.ctx.settle(
      result,
      self.settled(),
      Outcome::quiet("Failed to delete notification"),
    )
  }

  fn settled(&self) -> CacheEffects {
    CacheEffects::new()
      .invalidate(keys::notifications::unread_count())
      .invalidate(keys::notifications::lists())
  }

  fn is_unread(&self, id: &str) -> bool {
    let cache = &self.ctx.cache;
    cache
      .keys(&keys::notifications::lists())
      .into_iter()
      .filter_map(|key| cache.get_data::<Vec<Notification>>(&key))
      .any(|list| list.iter().any(|n| n.id == id && !n.read))
  }

  /// Only a cached counter moves.
  fn adjust_unread(&self, f: fn(UnreadCount) -> UnreadCount) -> PatchSet {
    self
      .ctx
      .cache
      .patch(&keys::notifications::unread_count(), move |count: Option<UnreadCount>| {
        count.map(f)
      })
  }
}
