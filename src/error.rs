//! Error taxonomy shared by the transport, cache, fetchers and mutations.

use thiserror::Error;

/// Failure of a single logical request after retries and refresh handling.
///
/// `Clone` so one refresh outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  /// No response was received.
  #[error("Network error: {0}")]
  Network(String),

  /// The request did not complete in time.
  #[error("Request timed out")]
  Timeout,

  /// The backend answered with a non-success status.
  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  /// The circuit breaker is open; no network attempt was made.
  #[error("Service unavailable (circuit open)")]
  CircuitOpen,

  /// Token refresh was exhausted or rejected; credentials were cleared.
  #[error("Session expired, please log in again")]
  AuthExpired,

  /// The response body did not match any known shape.
  #[error("Unexpected response: {0}")]
  Decode(String),
}

impl TransportError {
  /// Whether this failure means no response was received at all.
  pub fn is_network_level(&self) -> bool {
    matches!(self, Self::Network(_) | Self::Timeout)
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Http { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for TransportError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

/// Errors from paginated list loaders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("A fetch for this list is already in progress")]
  AlreadyLoading,

  #[error(transparent)]
  Transport(#[from] TransportError),
}

/// Errors from mutation orchestrators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
  /// A required identifier was missing; nothing was sent.
  #[error("Validation failed: {0}")]
  Validation(String),

  #[error(transparent)]
  Transport(#[from] TransportError),
}

impl MutationError {
  pub fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }
}

/// Errors from the push channel bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
  #[error("Push channel requires an authenticated session")]
  Unauthenticated,

  #[error("Push channel connection failed: {0}")]
  Connect(String),
}

/// Errors from credential persistence.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("Credential store error: {0}")]
  Store(#[from] rusqlite::Error),

  #[error("Credential store I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Could not determine data directory")]
  NoDataDir,
}
