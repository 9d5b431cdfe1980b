use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connector::{EventStream, PushConnector};
use crate::cache::EntityCache;
use crate::error::PushError;
use crate::notice::NoticeSink;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
  Disconnected,
  Connecting,
  Connected,
}

struct BridgeState {
  state: PushState,
  /// Bumped on every connect attempt and disconnect; a reader from an
  /// older generation must not touch the state
  generation: u64,
  reader: Option<JoinHandle<()>>,
}

type SharedState = Arc<Mutex<BridgeState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BridgeState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the single push connection of a session and feeds its events into
/// the cache.
pub struct PushBridge {
  connector: Arc<dyn PushConnector>,
  session: Arc<Session>,
  cache: EntityCache,
  notices: NoticeSink,
  state: SharedState,
}

impl PushBridge {
  pub fn new(
    connector: Arc<dyn PushConnector>,
    session: Arc<Session>,
    cache: EntityCache,
    notices: NoticeSink,
  ) -> Self {
    Self {
      connector,
      session,
      cache,
      notices,
      state: Arc::new(Mutex::new(BridgeState {
        state: PushState::Disconnected,
        generation: 0,
        reader: None,
      })),
    }
  }

  pub fn state(&self) -> PushState {
    lock(&self.state).state
  }

  pub fn is_connected(&self) -> bool {
    self.state() == PushState::Connected
  }

  /// Open the connection with the current token.
  ///
  /// Does nothing when a connection is already open or being opened.
  pub async fn connect(&self) -> Result<(), PushError> {
    let token = self.session.access_token().ok_or(PushError::Unauthenticated)?;
    let user_id = self.session.user_id();

    let generation = {
      let mut state = lock(&self.state);
      if state.state != PushState::Disconnected {
        debug!(state = ?state.state, "Push channel already up");
        return Ok(());
      }
      state.state = PushState::Connecting;
      state.generation += 1;
      state.generation
    };

    let stream = match self.connector.connect(&token, user_id.as_deref()).await {
      Ok(stream) => stream,
      Err(e) => {
        let mut state = lock(&self.state);
        if state.generation == generation {
          state.state = PushState::Disconnected;
        }
        warn!("Push connect failed: {}", e);
        return Err(e);
      }
    };

    let mut state = lock(&self.state);
    if state.generation != generation {
      // disconnect() ran while the handshake was in flight
      debug!("Dropping push stream from a cancelled connect");
      return Ok(());
    }
    state.state = PushState::Connected;
    state.reader = Some(tokio::spawn(read_events(
      stream,
      self.cache.clone(),
      self.notices.clone(),
      Arc::clone(&self.state),
      generation,
    )));
    info!("Push channel connected");
    Ok(())
  }

  /// Close the connection and stop the reader task.
  pub fn disconnect(&self) {
    let mut state = lock(&self.state);
    state.generation += 1;
    let was = std::mem::replace(&mut state.state, PushState::Disconnected);
    if let Some(reader) = state.reader.take() {
      reader.abort();
    }
    if was != PushState::Disconnected {
      info!("Push channel disconnected");
    }
  }
}

impl Drop for PushBridge {
  fn drop(&mut self) {
    if let Some(reader) = lock(&self.state).reader.take() {
      reader.abort();
    }
  }
}

async fn read_events(
  mut events: EventStream,
  cache: EntityCache,
  notices: NoticeSink,
  state: SharedState,
  generation: u64,
) {
  while let Some(next) = events.next().await {
    match next {
      Ok(event) => {
        debug!(?event, "Push event");
        event.effects().apply(&cache, &notices);
      }
      Err(e) => {
        warn!("Push stream failed: {}", e);
        break;
      }
    }
  }

  // Caches fall back to TTL staleness from here on
  let mut state = lock(&state);
  if state.generation == generation {
    state.state = PushState::Disconnected;
    state.reader = None;
    info!("Push channel closed by server");
  }
}
