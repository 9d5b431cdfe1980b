//! Paginated list loaders.
//!
//! One [`Paginator`] per list family. It owns the page cursor and the
//! loading flag; the items themselves live in the entity cache under the
//! family key, so mutations and push events see and patch the same list.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::envelope::{self, ItemMapper};
use crate::api::{ApiClient, FeedItem, ListEndpoint, Notification, UserProfile};
use crate::cache::{keys, merge_by_id, CacheResult, EntityCache, Entity, QueryKey};
use crate::config::Config;
use crate::error::{FetchError, TransportError};

/// Position of a list family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
  /// Last page loaded; 0 before the first fetch
  pub page: u32,
  pub page_size: u32,
  pub has_more: bool,
  pub max_pages: u32,
}

impl PageCursor {
  pub fn new(page_size: u32, max_pages: u32) -> Self {
    Self {
      page: 0,
      page_size: page_size.max(1),
      has_more: true,
      max_pages: max_pages.max(1),
    }
  }

  /// Whether another page should be requested after `page` came back with
  /// `received` items.
  fn more_after(&self, page: u32, received: usize, server_flag: Option<bool>) -> bool {
    server_flag != Some(false) && received >= self.page_size as usize && page < self.max_pages
  }
}

#[derive(Debug)]
struct PagerState {
  cursor: PageCursor,
  loading: bool,
}

/// Clears the loading flag when the fetch settles or is dropped.
struct LoadingGuard<'a> {
  state: &'a Mutex<PagerState>,
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    self.state.lock().unwrap_or_else(|e| e.into_inner()).loading = false;
  }
}

pub struct Paginator<T: Entity> {
  key: QueryKey,
  endpoint: ListEndpoint,
  mapper: ItemMapper<T>,
  api: ApiClient,
  cache: EntityCache,
  ttl: Duration,
  state: Mutex<PagerState>,
}

impl<T: Entity> Paginator<T> {
  pub fn new(
    api: ApiClient,
    cache: EntityCache,
    key: QueryKey,
    endpoint: ListEndpoint,
    mapper: ItemMapper<T>,
    cursor: PageCursor,
    ttl: Duration,
  ) -> Self {
    Self {
      key,
      endpoint,
      mapper,
      api,
      cache,
      ttl,
      state: Mutex::new(PagerState {
        cursor,
        loading: false,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, PagerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn cursor(&self) -> PageCursor {
    self.lock().cursor
  }

  pub fn has_more(&self) -> bool {
    self.lock().cursor.has_more
  }

  pub fn is_loading(&self) -> bool {
    self.lock().loading
  }

  /// Items currently cached for this family, optimistic patches included.
  pub fn items(&self) -> Vec<T> {
    self.cache.get_data(&self.key).unwrap_or_default()
  }

  /// Load the page after the last one and append it.
  ///
  /// Fails with `AlreadyLoading` while another fetch for this family is
  /// outstanding. Once the list is exhausted this returns the cached items
  /// without a network call.
  pub async fn fetch_next_page(&self) -> Result<CacheResult<Vec<T>>, FetchError> {
    let page = {
      let mut state = self.lock();
      if state.loading {
        return Err(FetchError::AlreadyLoading);
      }
      if !state.cursor.has_more {
        drop(state);
        return Ok(self.cached());
      }
      state.loading = true;
      state.cursor.page + 1
    };
    let _loading = LoadingGuard { state: &self.state };

    self.load(page, false).await
  }

  /// Reload from page 1, replacing the cached items.
  pub async fn refresh(&self) -> Result<CacheResult<Vec<T>>, FetchError> {
    {
      let mut state = self.lock();
      if state.loading {
        return Err(FetchError::AlreadyLoading);
      }
      state.loading = true;
    }
    let _loading = LoadingGuard { state: &self.state };

    self.load(1, true).await
  }

  /// Forget the cursor (session teardown). Cached items are the cache's.
  pub fn reset(&self) {
    let mut state = self.lock();
    state.cursor = PageCursor::new(state.cursor.page_size, state.cursor.max_pages);
  }

  async fn load(&self, page: u32, replace: bool) -> Result<CacheResult<Vec<T>>, FetchError> {
    let page_size = self.lock().cursor.page_size;
    debug!(key = %self.key, entity = T::entity_type(), page, "Fetching page");

    let result = self
      .api
      .list_page(&self.endpoint, page, page_size)
      .await
      .map(|raw| raw.decode(self.endpoint.envelope.name, self.mapper));

    match result {
      Ok(normalized) => {
        let received = normalized.received;
        let items = if replace {
          let deduped = merge_by_id(Vec::new(), normalized.items);
          self.cache.set(&self.key, &deduped, Some(self.ttl));
          self.cache.get_data(&self.key).unwrap_or(deduped)
        } else {
          self.cache.append_list(&self.key, &normalized.items, Some(self.ttl))
        };

        let mut state = self.lock();
        state.cursor.has_more = state.cursor.more_after(page, received, normalized.has_more);
        state.cursor.page = page;
        debug!(
          key = %self.key,
          page,
          received,
          has_more = state.cursor.has_more,
          "Page loaded"
        );
        Ok(CacheResult::from_network(items))
      }
      Err(e) => self.degrade(e),
    }
  }

  fn degrade(&self, error: TransportError) -> Result<CacheResult<Vec<T>>, FetchError> {
    let cached = self
      .cache
      .get(&self.key)
      .and_then(|entry| entry.decode::<Vec<T>>().map(|items| (items, entry.fetched_at)));

    match cached {
      Some((items, fetched_at)) => {
        warn!(key = %self.key, "Page fetch failed, serving cached list: {}", error);
        self.cache.mark_error(&self.key, &error);
        Ok(CacheResult::offline(items, fetched_at, error))
      }
      None => Err(error.into()),
    }
  }

  fn cached(&self) -> CacheResult<Vec<T>> {
    match self.cache.get(&self.key) {
      Some(entry) => {
        let stale = entry.status != crate::cache::EntryStatus::Fresh;
        let fetched_at = entry.fetched_at;
        CacheResult::from_cache(entry.decode().unwrap_or_default(), fetched_at, stale)
      }
      None => CacheResult::from_network(Vec::new()),
    }
  }
}

// ============================================================================
// List families
// ============================================================================

impl Paginator<FeedItem> {
  fn items_list(api: ApiClient, cache: EntityCache, config: &Config, key: QueryKey, endpoint: ListEndpoint) -> Self {
    Self::new(
      api,
      cache,
      key,
      endpoint,
      envelope::feed_item,
      PageCursor::new(config.paging.page_size, config.paging.max_pages),
      config.cache.feed_ttl(),
    )
  }

  /// The signed-in user's home feed.
  pub fn feed(api: ApiClient, cache: EntityCache, config: &Config) -> Self {
    Self::items_list(api, cache, config, keys::items::feed(), ListEndpoint::feed())
  }

  /// Every item, newest first.
  pub fn timeline(api: ApiClient, cache: EntityCache, config: &Config) -> Self {
    Self::items_list(api, cache, config, keys::items::timeline(), ListEndpoint::all_items())
  }

  pub fn by_user(api: ApiClient, cache: EntityCache, config: &Config, user_id: &str) -> Self {
    Self::items_list(
      api,
      cache,
      config,
      keys::items::by_user(user_id),
      ListEndpoint::user_items(user_id),
    )
  }

  pub fn search(api: ApiClient, cache: EntityCache, config: &Config, query: &str) -> Self {
    Self::items_list(
      api,
      cache,
      config,
      keys::items::search(query),
      ListEndpoint::search_items(query),
    )
  }
}

impl Paginator<UserProfile> {
  fn users_list(api: ApiClient, cache: EntityCache, config: &Config, key: QueryKey, endpoint: ListEndpoint) -> Self {
    Self::new(
      api,
      cache,
      key,
      endpoint,
      envelope::user_profile,
      PageCursor::new(config.paging.page_size, config.paging.max_pages),
      config.cache.default_ttl(),
    )
  }

  pub fn search(api: ApiClient, cache: EntityCache, config: &Config, query: Option<&str>) -> Self {
    Self::users_list(api, cache, config, keys::users::search(query), ListEndpoint::users(query))
  }

  pub fn followers(api: ApiClient, cache: EntityCache, config: &Config, user_id: &str) -> Self {
    Self::users_list(
      api,
      cache,
      config,
      keys::users::followers(user_id),
      ListEndpoint::followers(user_id),
    )
  }

  pub fn following(api: ApiClient, cache: EntityCache, config: &Config, user_id: &str) -> Self {
    Self::users_list(
      api,
      cache,
      config,
      keys::users::following(user_id),
      ListEndpoint::following(user_id),
    )
  }
}

impl Paginator<Notification> {
  pub fn inbox(api: ApiClient, cache: EntityCache, config: &Config) -> Self {
    Self::new(
      api,
      cache,
      keys::notifications::inbox(),
      ListEndpoint::notifications(),
      envelope::notification,
      PageCursor::new(config.paging.notification_page_size, config.paging.max_pages),
      config.cache.notification_ttl(),
    )
  }
}
