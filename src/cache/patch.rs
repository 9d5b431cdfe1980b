//! Per-key stack of optimistic patches.
//!
//! Each patch records the value visible just before it was applied and the
//! updater that produced its own value. The stack depth is the number of
//! unsettled mutations holding the key. Rolling back the top patch restores
//! exactly its previous value; rolling back an inner patch restores its
//! previous value and re-applies every patch above it, so siblings keep
//! their effect. Committed patches at the bottom of the stack are folded
//! into the base and dropped.

use serde_json::Value;
use std::sync::Arc;

/// Transforms the visible value of a key. `None` means "no entry".
pub type Updater = Arc<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchId(pub(crate) u64);

struct Patch {
  id: PatchId,
  previous: Option<Value>,
  applied: Option<Value>,
  updater: Updater,
  committed: bool,
}

#[derive(Default)]
pub(crate) struct PatchStack {
  patches: Vec<Patch>,
}

impl PatchStack {
  pub fn is_empty(&self) -> bool {
    self.patches.is_empty()
  }

  pub fn depth(&self) -> usize {
    self.patches.len()
  }

  /// Apply a new patch on top of `current`, returning the new visible value.
  pub fn push(&mut self, id: PatchId, current: Option<Value>, updater: Updater) -> Option<Value> {
    let applied = updater(current.clone());
    self.patches.push(Patch {
      id,
      previous: current,
      applied: applied.clone(),
      updater,
      committed: false,
    });
    applied
  }

  /// Value this patch produced, as currently rebased.
  pub fn applied(&self, id: PatchId) -> Option<Option<Value>> {
    self
      .patches
      .iter()
      .find(|p| p.id == id)
      .map(|p| p.applied.clone())
  }

  /// Undo one patch. Returns the new visible value, or `None` if the patch
  /// is not on this stack.
  pub fn rollback(&mut self, id: PatchId) -> Option<Option<Value>> {
    let index = self.position(id)?;
    let removed = self.patches.remove(index);
    let visible = self.replay_from(index, removed.previous);
    self.prune();
    Some(visible)
  }

  /// Settle one patch as confirmed. `canonical` replaces the value the
  /// patch produced and everything above it is rebased onto it.
  pub fn commit(&mut self, id: PatchId, canonical: Option<Value>) -> Option<Option<Value>> {
    let index = self.position(id)?;
    let patch = &mut self.patches[index];
    patch.committed = true;
    if canonical.is_some() {
      patch.applied = canonical;
    }
    let base = patch.applied.clone();
    let visible = self.replay_from(index + 1, base);
    self.prune();
    Some(visible)
  }

  /// The server-side value moved underneath the patches (refetch, push
  /// update). Re-apply every patch on top of it.
  pub fn rebase(&mut self, base: Option<Value>) -> Option<Value> {
    self.replay_from(0, base)
  }

  /// Value below every patch.
  pub fn base(&self) -> Option<Option<Value>> {
    self.patches.first().map(|p| p.previous.clone())
  }

  fn position(&self, id: PatchId) -> Option<usize> {
    self.patches.iter().position(|p| p.id == id)
  }

  fn replay_from(&mut self, start: usize, mut value: Option<Value>) -> Option<Value> {
    for patch in &mut self.patches[start..] {
      patch.previous = value.clone();
      value = (patch.updater)(value);
      patch.applied = value.clone();
    }
    value
  }

  fn prune(&mut self) {
    let settled = self.patches.iter().take_while(|p| p.committed).count();
    self.patches.drain(..settled);
  }
}
