//! Mutation orchestrators.
//!
//! Every mutation validates its identifiers, patches the cache
//! optimistically where the outcome is predictable, sends the request and
//! then settles: patches are committed or rolled back, affected entries
//! are invalidated and exactly one notice reports a failure.

mod items;
mod notifications;
mod users;

pub use items::ItemMutations;
pub use notifications::NotificationMutations;
pub use users::UserMutations;

use std::time::Duration;
use tracing::warn;

use crate::api::ApiClient;
use crate::cache::EntityCache;
use crate::error::{MutationError, TransportError};
use crate::notice::{Notice, NoticeSink};
use crate::sync::CacheEffects;
use crate::transport::GENERIC_ERROR_MESSAGE;

/// What a mutation says when it settles.
#[derive(Debug, Clone, Copy)]
struct Outcome {
  success: Option<&'static str>,
  failure: &'static str,
}

impl Outcome {
  const fn quiet(failure: &'static str) -> Self {
    Self {
      success: None,
      failure,
    }
  }

  const fn loud(success: &'static str, failure: &'static str) -> Self {
    Self {
      success: Some(success),
      failure,
    }
  }
}

/// Collaborators shared by the orchestrators.
#[derive(Clone)]
pub(crate) struct MutationContext {
  api: ApiClient,
  cache: EntityCache,
  notices: NoticeSink,
  detail_ttl: Duration,
}

impl MutationContext {
  pub fn new(api: ApiClient, cache: EntityCache, notices: NoticeSink, detail_ttl: Duration) -> Self {
    Self {
      api,
      cache,
      notices,
      detail_ttl,
    }
  }

  /// Apply the settlement. On success the whole `effects` value runs;
  /// on failure only its invalidations do, followed by one failure notice.
  fn settle<R>(
    &self,
    result: Result<R, TransportError>,
    effects: CacheEffects,
    outcome: Outcome,
  ) -> Result<R, MutationError> {
    match result {
      Ok(value) => {
        let effects = match outcome.success {
          Some(message) => effects.notice(Notice::MutationSucceeded(message.to_string())),
          None => effects,
        };
        effects.apply(&self.cache, &self.notices);
        Ok(value)
      }
      Err(e) => {
        warn!("{}: {}", outcome.failure, e);
        CacheEffects {
          updates: Vec::new(),
          invalidations: effects.invalidations,
          notice: Some(Notice::MutationFailed(failure_message(&e, outcome.failure))),
        }
        .apply(&self.cache, &self.notices);
        Err(e.into())
      }
    }
  }

  /// Validation failures are reported like any other failed mutation.
  fn reject(&self, error: MutationError) -> MutationError {
    self.notices.send(Notice::MutationFailed(error.to_string()));
    error
  }

  fn require(&self, id: &str, what: &str) -> Result<(), MutationError> {
    if id.trim().is_empty() {
      return Err(self.reject(MutationError::validation(format!("{} is required", what))));
    }
    Ok(())
  }
}

/// The server's own message for a rejected request, else `fallback`.
fn failure_message(error: &TransportError, fallback: &str) -> String {
  match error {
    TransportError::Http { message, .. }
      if !message.is_empty() && message != GENERIC_ERROR_MESSAGE =>
    {
      message.clone()
    }
    _ => fallback.to_string(),
  }
}

/// Counter step for a toggle, clamped at zero.
fn step(count: u64, up: bool) -> u64 {
  if up {
    count.saturating_add(1)
  } else {
    count.saturating_sub(1)
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::notice::{drain, NoticeReceiver};
  use crate::transport::testing::{authed_session, transport_with, ScriptedBackend};
  use std::sync::Arc;

  pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub cache: EntityCache,
    pub ctx: MutationContext,
    rx: NoticeReceiver,
  }

  impl Harness {
    pub fn new(backend: ScriptedBackend) -> Self {
      let backend = Arc::new(backend);
      let (notices, rx) = NoticeSink::channel();
      let transport = transport_with(backend.clone(), authed_session("tok"), notices.clone());
      let cache = EntityCache::new(Duration::from_secs(60));
      let ctx = MutationContext::new(
        ApiClient::new(transport),
        cache.clone(),
        notices,
        Duration::from_secs(300),
      );
      Self {
        backend,
        cache,
        ctx,
        rx,
      }
    }

    pub fn notices(&mut self) -> Vec<Notice> {
      drain(&mut self.rx)
    }
  }
}
