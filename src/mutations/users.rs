use std::sync::Arc;
use tracing::instrument;

use super::{step, MutationContext, Outcome};
use crate::api::{ProfileUpdate, UserProfile};
use crate::cache::{keys, PatchSet};
use crate::error::MutationError;
use crate::sync::CacheEffects;

/// Follow, block and profile edits.
#[derive(Clone)]
pub struct UserMutations {
  ctx: MutationContext,
}

impl UserMutations {
  pub(crate) fn new(ctx: MutationContext) -> Self {
    Self { ctx }
  }

  /// Follow or unfollow, depending on what the cache shows. Returns whether
  /// the user is now followed.
  #[instrument(skip(self))]
  pub async fn toggle_follow(&self, user_id: &str) -> Result<bool, MutationError> {
    self.ctx.require(user_id, "User id")?;

    let shown = self.visible_user(user_id);
    let follow = !shown.as_ref().is_some_and(|u| u.is_following);
    // The own counter moves only with a follow state the cache actually shows
    let flips = shown.is_some_and(|u| u.is_following != follow);
    let patches = self
      .patch_user(user_id, move |user| {
        if user.is_following != follow {
          user.is_following = follow;
          user.follower_count = step(user.follower_count, follow);
        }
      })
      .join(self.ctx.cache.patch(&keys::users::me(), move |me: Option<UserProfile>| {
        me.map(|mut me| {
          if flips {
            me.following_count = step(me.following_count, follow);
          }
          me
        })
      }));

    let result = if follow {
      self.ctx.api.follow(user_id).await
    } else {
      self.ctx.api.unfollow(user_id).await
    };
    patches.settle(&result);

    let mut effects = self.settled(user_id).invalidate(keys::users::me());
    if let Some(me) = self.ctx.api.transport().session().user_id() {
      effects = effects.invalidate(keys::users::following(&me));
    }
    let outcome = if follow {
      Outcome::loud("User followed successfully!", "Failed to follow user")
    } else {
      Outcome::loud("User unfollowed successfully!", "Failed to unfollow user")
    };
    self.ctx.settle(result, effects, outcome).map(|_| follow)
  }

  /// Blocking also drops any follow.
  #[instrument(skip(self))]
  pub async fn block(&self, user_id: &str) -> Result<(), MutationError> {
    self.ctx.require(user_id, "User id")?;

    let patches = self.patch_user(user_id, |user| {
      user.is_blocked = true;
      if user.is_following {
        user.is_following = false;
        user.follower_count = user.follower_count.saturating_sub(1);
      }
    });
    let result = self.ctx.api.block(user_id).await;
    patches.settle(&result);

    self.ctx.settle(
      result,
      self.settled(user_id),
      Outcome::loud("User blocked successfully!", "Failed to block user"),
    )
  }

  #[instrument(skip(self))]
  pub async fn unblock(&self, user_id: &str) -> Result<(), MutationError> {
    self.ctx.require(user_id, "User id")?;

    let patches = self.patch_user(user_id, |user| user.is_blocked = false);
    let result = self.ctx.api.unblock(user_id).await;
    patches.settle(&result);

    self.ctx.settle(
      result,
      CacheEffects::new().invalidate(keys::users::detail(user_id)),
      Outcome::loud("User unblocked successfully!", "Failed to unblock user"),
    )
  }

  /// Edit the signed-in user's profile. The server's answer replaces the
  /// optimistic edit.
  #[instrument(skip(self, update))]
  pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, MutationError> {
    let edit = update.clone();
    let result = self
      .ctx
      .cache
      .optimistic_update_merge(
        &keys::users::me(),
        move |me: Option<UserProfile>| {
          me.map(|mut me| {
            if let Some(name) = &edit.display_name {
              me.display_name = name.clone();
            }
            if let Some(bio) = &edit.bio {
              me.bio = Some(bio.clone());
            }
            if let Some(image) = &edit.image {
              me.avatar = image.clone();
            }
            me
          })
        },
        self.ctx.api.update_profile(&update),
        |_, canonical: &UserProfile| Some(canonical.clone()),
      )
      .await;

    if let Ok(user) = &result {
      self
        .ctx
        .cache
        .set(&keys::users::detail(&user.id), user, Some(self.ctx.detail_ttl));
    }
    self.ctx.settle(
      result,
      CacheEffects::new().invalidate(keys::users::lists()),
      Outcome::loud("Profile updated successfully!", "Failed to update profile"),
    )
  }

  fn settled(&self, user_id: &str) -> CacheEffects {
    CacheEffects::new()
      .invalidate(keys::users::detail(user_id))
      .invalidate(keys::users::followers(user_id))
      .invalidate(keys::users::following(user_id))
  }

  fn visible_user(&self, id: &str) -> Option<UserProfile> {
    let cache = &self.ctx.cache;
    cache.get_data(&keys::users::detail(id)).or_else(|| {
      cache
        .keys(&keys::users::lists())
        .into_iter()
        .filter_map(|key| cache.get_data::<Vec<UserProfile>>(&key))
        .find_map(|list| list.into_iter().find(|u| u.id == id))
    })
  }

  /// Patch the user's detail entry and every user list holding them.
  fn patch_user<F>(&self, id: &str, edit: F) -> PatchSet
  where
    F: Fn(&mut UserProfile) + Send + Sync + 'static,
  {
    let edit = Arc::new(edit);
    let in_detail = Arc::clone(&edit);
    let target = id.to_string();

    self
      .ctx
      .cache
      .patch(&keys::users::detail(id), move |user: Option<UserProfile>| {
        user.map(|mut user| {
          in_detail(&mut user);
          user
        })
      })
      .join(
        self
          .ctx
          .cache
          .patch_lists(&keys::users::lists(), move |list: &mut Vec<UserProfile>| {
            list.iter_mut().filter(|u| u.id == target).for_each(|u| edit(u));
          }),
      )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mutations::testing::Harness;
  use crate::notice::Notice;
  use crate::transport::testing::{ok, refused, ScriptedBackend};
  use serde_json::json;

  fn user(id: &str, followers: u64, following: bool) -> UserProfile {
    UserProfile {
      id: id.into(),
      handle: format!("user{}", id),
      display_name: format!("User {}", id),
      avatar: String::new(),
      bio: None,
      follower_count: followers,
      following_count: 0,
      is_following: following,
      is_blocked: false,
    }
  }

  #[tokio::test]
  async fn test_follow_updates_profile_lists_and_me() {
    let mut h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    h.cache.set(&keys::users::detail("2"), &user("2", 3, false), None);
    h.cache.set(&keys::users::search(Some("us")), &vec![user("2", 3, false)], None);
    h.cache.set(&keys::users::me(), &user("me", 0, false), None);
    let mutations = UserMutations::new(h.ctx.clone());

    assert!(mutations.toggle_follow("2").await.unwrap());

    let shown: UserProfile = h.cache.get_data(&keys::users::detail("2")).unwrap();
    assert!(shown.is_following);
    assert_eq!(shown.follower_count, 4);
    let listed: Vec<UserProfile> = h.cache.get_data(&keys::users::search(Some("us"))).unwrap();
    assert_eq!(listed[0].follower_count, 4);
    let me: UserProfile = h.cache.get_data(&keys::users::me()).unwrap();
    assert_eq!(me.following_count, 1);
    assert_eq!(h.backend.count("POST", "/users/2/follow"), 1);
    assert_eq!(
      h.notices(),
      vec![Notice::MutationSucceeded("User followed successfully!".into())]
    );
  }

  #[tokio::test]
  async fn test_follow_of_uncached_user_leaves_own_count() {
    let h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    let mut me = user("me", 0, false);
    me.following_count = 5;
    h.cache.set(&keys::users::me(), &me, None);
    let mutations = UserMutations::new(h.ctx.clone());

    assert!(mutations.toggle_follow("2").await.unwrap());
    let me: UserProfile = h.cache.get_data(&keys::users::me()).unwrap();
    assert_eq!(me.following_count, 5);
    assert_eq!(h.backend.count("POST", "/users/2/follow"), 1);
  }

  #[tokio::test]
  async fn test_unfollow_steps_own_count_down() {
    let h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    h.cache.set(&keys::users::detail("2"), &user("2", 1, true), None);
    let mut me = user("me", 0, false);
    me.following_count = 5;
    h.cache.set(&keys::users::me(), &me, None);
    let mutations = UserMutations::new(h.ctx.clone());

    assert!(!mutations.toggle_follow("2").await.unwrap());
    let me: UserProfile = h.cache.get_data(&keys::users::me()).unwrap();
    assert_eq!(me.following_count, 4);
    assert_eq!(h.backend.count("DELETE", "/users/2/follow"), 1);
  }

  #[tokio::test]
  async fn test_failed_unfollow_rolls_back() {
    let mut h = Harness::new(ScriptedBackend::new(|_| refused()));
    h.cache.set(&keys::users::detail("2"), &user("2", 1, true), None);
    let mutations = UserMutations::new(h.ctx.clone());

    assert!(mutations.toggle_follow("2").await.is_err());
    let shown: UserProfile = h.cache.get_data(&keys::users::detail("2")).unwrap();
    assert_eq!(shown, user("2", 1, true));
    assert_eq!(
      h.notices(),
      vec![Notice::MutationFailed("Failed to unfollow user".into())]
    );
  }

  #[tokio::test]
  async fn test_block_drops_follow() {
    let h = Harness::new(ScriptedBackend::new(|_| ok(json!({}))));
    h.cache.set(&keys::users::detail("2"), &user("2", 1, true), None);
    let mutations = UserMutations::new(h.ctx.clone());

    mutations.block("2").await.unwrap();
    let shown: UserProfile = h.cache.get_data(&keys::users::detail("2")).unwrap();
    assert!(shown.is_blocked);
    assert!(!shown.is_following);
    assert_eq!(shown.follower_count, 0);
  }

  #[tokio::test]
  async fn test_update_profile_takes_server_copy() {
    let h = Harness::new(ScriptedBackend::new(|_| {
      ok(json!({"user": {"_id": "me", "username": "ann", "bio": "from server"}}))
    }));
    h.cache.set(&keys::users::me(), &user("me", 0, false), None);
    let mutations = UserMutations::new(h.ctx.clone());

    let updated = mutations
      .update_profile(ProfileUpdate {
        bio: Some("typed".into()),
        ..Default::default()
      })
      .await
      .unwrap();

    assert_eq!(updated.bio.as_deref(), Some("from server"));
    let me: UserProfile = h.cache.get_data(&keys::users::me()).unwrap();
    assert_eq!(me.bio.as_deref(), Some("from server"));
    assert!(h.cache.contains(&keys::users::detail("me")));
  }
}
