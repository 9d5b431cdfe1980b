//! In-memory entity cache.
//!
//! Entries are stored as JSON values in canonical schema, keyed by
//! [`QueryKey`]. The visible value of a key is its server value with any
//! pending optimistic patches applied on top.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::keys::QueryKey;
use super::patch::{PatchId, PatchStack, Updater};
use super::traits::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Fresh,
  /// Past its TTL or explicitly invalidated
  Stale,
  /// The last refetch failed; data is from an earlier fetch
  Error,
}

/// Snapshot of one entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
  pub stale_after: Duration,
  pub status: EntryStatus,
  pub error: Option<String>,
  /// Unsettled optimistic mutations on this key
  pub pending_patches: usize,
}

impl CacheEntry {
  pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
    serde_json::from_value(self.data.clone()).ok()
  }
}

struct Stored {
  data: Value,
  fetched_at: DateTime<Utc>,
  fetched_instant: Instant,
  ttl: Duration,
  invalidated: bool,
  error: Option<String>,
}

impl Stored {
  fn new(data: Value, ttl: Duration) -> Self {
    Self {
      data,
      fetched_at: Utc::now(),
      fetched_instant: Instant::now(),
      ttl,
      invalidated: false,
      error: None,
    }
  }

  fn status(&self) -> EntryStatus {
    if self.error.is_some() {
      EntryStatus::Error
    } else if self.invalidated || self.fetched_instant.elapsed() >= self.ttl {
      EntryStatus::Stale
    } else {
      EntryStatus::Fresh
    }
  }
}

#[derive(Default)]
struct Slot {
  stored: Option<Stored>,
  patches: PatchStack,
}

impl Slot {
  fn visible(&self) -> Option<Value> {
    self.stored.as_ref().map(|s| s.data.clone())
  }

  /// Replace the visible value, keeping fetch metadata. Values created
  /// from nothing are local-only and start out stale.
  fn show(&mut self, value: Option<Value>, ttl: Duration) {
    match (value, self.stored.as_mut()) {
      (Some(data), Some(stored)) => stored.data = data,
      (Some(data), None) => {
        let mut stored = Stored::new(data, ttl);
        stored.invalidated = true;
        self.stored = Some(stored);
      }
      (None, _) => self.stored = None,
    }
  }

  fn is_vacant(&self) -> bool {
    self.stored.is_none() && self.patches.is_empty()
  }
}

struct CacheState {
  slots: BTreeMap<QueryKey, Slot>,
  next_patch: u64,
}

impl CacheState {
  fn tidy(&mut self, key: &QueryKey) {
    if self.slots.get(key).is_some_and(Slot::is_vacant) {
      self.slots.remove(key);
    }
  }

  fn prefixed(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self
      .slots
      .range(prefix.clone()..)
      .take_while(|(k, _)| k.starts_with(prefix))
      .map(|(k, _)| k.clone())
      .collect()
  }
}

/// Shared entity cache. Cheap to clone; every clone sees the same entries.
#[derive(Clone)]
pub struct EntityCache {
  state: Arc<Mutex<CacheState>>,
  default_ttl: Duration,
}

impl EntityCache {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      state: Arc::new(Mutex::new(CacheState {
        slots: BTreeMap::new(),
        next_patch: 0,
      })),
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    let state = self.lock();
    let slot = state.slots.get(key)?;
    let stored = slot.stored.as_ref()?;
    Some(CacheEntry {
      key: key.clone(),
      data: stored.data.clone(),
      fetched_at: stored.fetched_at,
      stale_after: stored.ttl,
      status: stored.status(),
      error: stored.error.clone(),
      pending_patches: slot.patches.depth(),
    })
  }

  /// Visible value decoded into `T`. `None` when missing or of another
  /// shape.
  pub fn get_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self.get(key).and_then(|entry| entry.decode())
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.get(key).is_some()
  }

  /// Every populated key under `prefix`.
  pub fn keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    let state = self.lock();
    state
      .prefixed(prefix)
      .into_iter()
      .filter(|k| state.slots.get(k).is_some_and(|s| s.stored.is_some()))
      .collect()
  }

  // ==========================================================================
  // Server writes
  // ==========================================================================

  /// Store fresh server data. Pending patches are re-applied on top.
  pub fn set<T: Serialize>(&self, key: &QueryKey, data: &T, ttl: Option<Duration>) {
    match serde_json::to_value(data) {
      Ok(value) => self.set_value(key, value, ttl),
      Err(e) => warn!(%key, "Not caching unserializable value: {}", e),
    }
  }

  pub fn set_value(&self, key: &QueryKey, value: Value, ttl: Option<Duration>) {
    let ttl = ttl.unwrap_or(self.default_ttl);
    let mut state = self.lock();
    let slot = state.slots.entry(key.clone()).or_default();

    let visible = if slot.patches.is_empty() {
      Some(value)
    } else {
      slot.patches.rebase(Some(value))
    };
    match visible {
      Some(data) => slot.stored = Some(Stored::new(data, ttl)),
      None => slot.stored = None,
    }
    state.tidy(key);
    debug!(%key, "Cache set");
  }

  /// Mark every entry under `prefix` stale. Returns how many matched.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let mut state = self.lock();
    let keys = state.prefixed(prefix);
    let mut count = 0;
    for key in keys {
      if let Some(stored) = state.slots.get_mut(&key).and_then(|s| s.stored.as_mut()) {
        stored.invalidated = true;
        count += 1;
      }
    }
    debug!(%prefix, count, "Invalidated");
    count
  }

  /// Record a failed refetch; data is kept.
  pub fn mark_error(&self, key: &QueryKey, error: impl ToString) {
    let mut state = self.lock();
    if let Some(stored) = state.slots.get_mut(key).and_then(|s| s.stored.as_mut()) {
      stored.error = Some(error.to_string());
    }
  }

  /// Drop an entry. Pending patches on it keep running against "no entry".
  pub fn remove(&self, key: &QueryKey) {
    let ttl = self.default_ttl;
    let mut state = self.lock();
    if let Some(slot) = state.slots.get_mut(key) {
      slot.stored = None;
      if !slot.patches.is_empty() {
        let visible = slot.patches.rebase(None);
        slot.show(visible, ttl);
      }
    }
    state.tidy(key);
  }

  /// Drop everything, including pending patches (session teardown).
  pub fn clear(&self) {
    self.lock().slots.clear();
  }

  // ==========================================================================
  // Local writes
  // ==========================================================================

  /// Apply a local change underneath any pending patches. The entry keeps
  /// its fetch time and status.
  pub fn update<T, F>(&self, key: &QueryKey, f: F) -> bool
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    let mut state = self.lock();
    let changed = match state.slots.get_mut(key) {
      Some(slot) => update_slot(slot, key, f, self.default_ttl),
      None => {
        let mut slot = Slot::default();
        let changed = update_slot(&mut slot, key, f, self.default_ttl);
        if changed {
          state.slots.insert(key.clone(), slot);
        }
        changed
      }
    };
    state.tidy(key);
    changed
  }

  /// Apply `f` to every list of `T` under `prefix`. Entries holding some
  /// other shape are skipped. Returns how many lists changed.
  pub fn update_lists<T, F>(&self, prefix: &QueryKey, mut f: F) -> usize
  where
    T: Entity,
    F: FnMut(&mut Vec<T>),
  {
    let mut state = self.lock();
    let mut count = 0;
    for key in state.prefixed(prefix) {
      let Some(slot) = state.slots.get_mut(&key) else {
        continue;
      };
      let changed = update_slot(
        slot,
        &key,
        |list: Option<Vec<T>>| {
          list.map(|mut items| {
            f(&mut items);
            items
          })
        },
        self.default_ttl,
      );
      if changed {
        count += 1;
      }
    }
    count
  }

  /// Append server items to a list, deduplicating by id. Items already
  /// present are replaced in place; new ones keep arrival order.
  pub fn append_list<T: Entity>(&self, key: &QueryKey, items: &[T], ttl: Option<Duration>) -> Vec<T> {
    let existing: Vec<T> = {
      let state = self.lock();
      state
        .slots
        .get(key)
        .and_then(|slot| match slot.patches.base() {
          Some(base) => base,
          None => slot.visible(),
        })
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
    };

    let merged = merge_by_id(existing, items.iter().cloned());
    self.set(key, &merged, ttl);
    self.get_data(key).unwrap_or(merged)
  }

  // ==========================================================================
  // Optimistic updates
  // ==========================================================================

  /// Apply `updater` immediately, then await `server_call`. On failure the
  /// key goes back to the value it had right before this update and the
  /// error is returned to the caller.
  pub async fn optimistic_update<T, U, Fut, R, E>(
    &self,
    key: &QueryKey,
    updater: U,
    server_call: Fut,
  ) -> Result<R, E>
  where
    T: Serialize + DeserializeOwned,
    U: Fn(Option<T>) -> Option<T> + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>>,
  {
    self
      .optimistic_update_merge(key, updater, server_call, |_: Option<T>, _: &R| None)
      .await
  }

  /// Like [`optimistic_update`](Self::optimistic_update), but on success
  /// `merge` may replace the optimistic value with a canonical one built
  /// from the server response. Returning `None` keeps the optimistic value.
  pub async fn optimistic_update_merge<T, U, Fut, R, E, M>(
    &self,
    key: &QueryKey,
    updater: U,
    server_call: Fut,
    merge: M,
  ) -> Result<R, E>
  where
    T: Serialize + DeserializeOwned,
    U: Fn(Option<T>) -> Option<T> + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>>,
    M: FnOnce(Option<T>, &R) -> Option<T>,
  {
    let id = self.apply_patch(key, typed_updater(updater));
    let held = PatchSet::new(self.clone(), vec![(key.clone(), id)]);

    match server_call.await {
      Ok(response) => {
        let applied = self
          .patch_value(key, id)
          .and_then(|v| serde_json::from_value(v).ok());
        let canonical = merge(applied, &response).and_then(|t| serde_json::to_value(t).ok());
        held.release();
        self.commit_patch(key, id, canonical);
        Ok(response)
      }
      Err(e) => {
        warn!(%key, "Rolling back optimistic update");
        held.rollback();
        Err(e)
      }
    }
  }

  /// Patch one key and hand the patch to the caller to settle.
  pub fn patch<T, U>(&self, key: &QueryKey, updater: U) -> PatchSet
  where
    T: Serialize + DeserializeOwned,
    U: Fn(Option<T>) -> Option<T> + Send + Sync + 'static,
  {
    let id = self.apply_patch(key, typed_updater(updater));
    PatchSet::new(self.clone(), vec![(key.clone(), id)])
  }

  /// Patch every cached list of `T` under `prefix` with the same edit.
  pub fn patch_lists<T, F>(&self, prefix: &QueryKey, f: F) -> PatchSet
  where
    T: Entity,
    F: Fn(&mut Vec<T>) + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    let keys = self.keys(prefix);
    let patches = keys
      .into_iter()
      .map(|key| {
        let f = Arc::clone(&f);
        let id = self.apply_patch(
          &key,
          typed_updater(move |list: Option<Vec<T>>| {
            list.map(|mut items| {
              f(&mut items);
              items
            })
          }),
        );
        (key, id)
      })
      .collect();
    PatchSet::new(self.clone(), patches)
  }

  fn apply_patch(&self, key: &QueryKey, updater: Updater) -> PatchId {
    let ttl = self.default_ttl;
    let mut state = self.lock();
    state.next_patch += 1;
    let id = PatchId(state.next_patch);

    let slot = state.slots.entry(key.clone()).or_default();
    let current = slot.visible();
    let applied = slot.patches.push(id, current, updater);
    slot.show(applied, ttl);
    debug!(%key, depth = slot.patches.depth(), "Optimistic patch applied");
    id
  }

  fn patch_value(&self, key: &QueryKey, id: PatchId) -> Option<Value> {
    self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.patches.applied(id))
      .flatten()
  }

  fn commit_patch(&self, key: &QueryKey, id: PatchId, canonical: Option<Value>) {
    self.settle(key, |patches| patches.commit(id, canonical));
  }

  fn rollback_patch(&self, key: &QueryKey, id: PatchId) {
    self.settle(key, |patches| patches.rollback(id));
  }

  fn settle(&self, key: &QueryKey, op: impl FnOnce(&mut PatchStack) -> Option<Option<Value>>) {
    let ttl = self.default_ttl;
    let mut state = self.lock();
    if let Some(slot) = state.slots.get_mut(key) {
      if let Some(visible) = op(&mut slot.patches) {
        slot.show(visible, ttl);
      }
    }
    state.tidy(key);
  }
}

/// Optimistic patches held by one in-flight mutation, settled together.
/// Dropping an unsettled set rolls every patch back.
#[must_use = "an unsettled patch set rolls back when dropped"]
pub struct PatchSet {
  cache: EntityCache,
  patches: Vec<(QueryKey, PatchId)>,
}

impl PatchSet {
  fn new(cache: EntityCache, patches: Vec<(QueryKey, PatchId)>) -> Self {
    Self { cache, patches }
  }

  pub fn len(&self) -> usize {
    self.patches.len()
  }

  pub fn is_empty(&self) -> bool {
    self.patches.is_empty()
  }

  /// Take over the patches of `other`; both settle as one.
  pub fn join(mut self, mut other: PatchSet) -> PatchSet {
    self.patches.append(&mut other.patches);
    self
  }

  /// Keep every patched value as confirmed.
  pub fn commit(mut self) {
    for (key, id) in std::mem::take(&mut self.patches) {
      self.cache.commit_patch(&key, id, None);
    }
  }

  /// Undo every patch, newest first.
  pub fn rollback(mut self) {
    self.undo();
  }

  /// Commit on `Ok`, roll back on `Err`.
  pub fn settle<R, E>(self, outcome: &Result<R, E>) {
    match outcome {
      Ok(_) => self.commit(),
      Err(_) => self.rollback(),
    }
  }

  /// Forget the patches without settling them.
  fn release(mut self) {
    self.patches.clear();
  }

  fn undo(&mut self) {
    while let Some((key, id)) = self.patches.pop() {
      self.cache.rollback_patch(&key, id);
    }
  }
}

impl Drop for PatchSet {
  fn drop(&mut self) {
    self.undo();
  }
}

fn typed_updater<T, U>(updater: U) -> Updater
where
  T: Serialize + DeserializeOwned,
  U: Fn(Option<T>) -> Option<T> + Send + Sync + 'static,
{
  Arc::new(move |value: Option<Value>| {
    let typed = match &value {
      Some(v) => match serde_json::from_value::<T>(v.clone()) {
        Ok(t) => Some(t),
        // Not ours to touch
        Err(_) => return value,
      },
      None => None,
    };
    match updater(typed) {
      Some(next) => serde_json::to_value(next).ok().or(value),
      None => None,
    }
  })
}

fn update_slot<T, F>(slot: &mut Slot, key: &QueryKey, f: F, ttl: Duration) -> bool
where
  T: Serialize + DeserializeOwned,
  F: FnOnce(Option<T>) -> Option<T>,
{
  let base = match slot.patches.base() {
    Some(base) => base,
    None => slot.visible(),
  };
  let typed = match &base {
    Some(v) => match serde_json::from_value::<T>(v.clone()) {
      Ok(t) => Some(t),
      Err(_) => return false,
    },
    None => None,
  };
  let next = match f(typed) {
    Some(t) => match serde_json::to_value(t) {
      Ok(v) => Some(v),
      Err(e) => {
        warn!(%key, "Local update produced unserializable value: {}", e);
        return false;
      }
    },
    None => None,
  };
  if next == base {
    return false;
  }

  let visible = if slot.patches.is_empty() {
    next
  } else {
    slot.patches.rebase(next)
  };
  slot.show(visible, ttl);
  true
}

/// Concatenate, keeping the first position of each id and the newest data.
pub fn merge_by_id<T: Entity>(existing: Vec<T>, incoming: impl IntoIterator<Item = T>) -> Vec<T> {
  let mut merged = existing;
  for item in incoming {
    match merged.iter().position(|e| e.id() == item.id()) {
      Some(index) => merged[index] = item,
      None => merged.push(item),
    }
  }
  merged
}
