//! Entity trait and read-result metadata.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Something that lives in cached lists and is deduplicated by id.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  fn id(&self) -> &str;

  /// Family segment of query keys, e.g. "items"
  fn entity_type() -> &'static str;
}

/// Data handed back by a read, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Fetch time of the cached copy; `None` for network data
  pub cached_at: Option<DateTime<Utc>>,
  /// Why the network copy could not be used
  pub error: Option<String>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self::tagged(data, CacheSource::Network, None, None)
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    let source = if is_stale {
      CacheSource::CacheStale
    } else {
      CacheSource::CacheFresh
    };
    Self::tagged(data, source, Some(cached_at), None)
  }

  /// Cached data served because the network fetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>, error: impl ToString) -> Self {
    Self::tagged(
      data,
      CacheSource::Offline,
      Some(cached_at),
      Some(error.to_string()),
    )
  }

  fn tagged(
    data: T,
    source: CacheSource,
    cached_at: Option<DateTime<Utc>>,
    error: Option<String>,
  ) -> Self {
    Self {
      data,
      source,
      cached_at,
      error,
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  /// Cached and within its TTL
  CacheFresh,
  /// Cached past its TTL, or invalidated
  CacheStale,
  /// Refetch failed; the cached copy is all there is
  Offline,
}
