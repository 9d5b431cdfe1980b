//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::TransportError;

use super::keys::QueryKey;
use super::store::{EntityCache, EntryStatus};
use super::traits::CacheResult;

/// Read path over an [`EntityCache`].
///
/// Sits between callers and the API client, providing transparent caching
/// and degrading to cached data when the network fails.
#[derive(Clone)]
pub struct CacheLayer {
  cache: EntityCache,
}

impl CacheLayer {
  pub fn new(cache: EntityCache) -> Self {
    Self { cache }
  }

  pub fn cache(&self) -> &EntityCache {
    &self.cache
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return the cached data flagged offline and
  ///    mark the entry as errored
  /// 4. Update cache with new data
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>, TransportError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
  {
    let cached = self
      .cache
      .get(key)
      .and_then(|entry| entry.decode::<T>().map(|data| (data, entry)));

    if let Some((data, entry)) = cached {
      if entry.status == EntryStatus::Fresh {
        return Ok(CacheResult::from_cache(data, entry.fetched_at, false));
      }

      debug!(%key, status = ?entry.status, "Cache stale, refetching");
      match fetcher().await {
        Ok(fresh) => {
          self.cache.set(key, &fresh, Some(ttl));
          Ok(self.visible_or(key, fresh))
        }
        Err(e) => {
          warn!(%key, "Fetch failed, serving cached data: {}", e);
          self.cache.mark_error(key, &e);
          Ok(CacheResult::offline(data, entry.fetched_at, e))
        }
      }
    } else {
      // No cache, must fetch from network
      let fresh = fetcher().await?;
      self.cache.set(key, &fresh, Some(ttl));
      Ok(self.visible_or(key, fresh))
    }
  }

  /// Network data as the cache shows it, i.e. with pending optimistic
  /// patches still applied.
  fn visible_or<T: DeserializeOwned>(&self, key: &QueryKey, fresh: T) -> CacheResult<T> {
    CacheResult::from_network(self.cache.get_data(key).unwrap_or(fresh))
  }
}
